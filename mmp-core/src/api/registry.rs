//! Shared pipeline and tracker cache
//!
//! One [`Registry`] per process owns the database, queue and dispatcher that
//! every [`Tracker`](super::Tracker) writes through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::Config;
use crate::db::Database;
use crate::dispatcher::{DispatchSettings, Dispatcher, HttpTransport, Transport};
use crate::error::Result;
use crate::queue::EventQueue;
use crate::store::PersistentStore;
use crate::types::Properties;

use super::tracker::Tracker;

/// Owns the database, queue and dispatcher shared by every tracker, and
/// hands out one [`Tracker`] per token.
pub struct Registry {
    config: Config,
    store: PersistentStore,
    dispatcher: Arc<Dispatcher>,
    trackers: Mutex<HashMap<String, Arc<Tracker>>>,
}

impl Registry {
    /// Open the database at the configured path and start the HTTP worker.
    pub fn open(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.api)?;
        let db = Database::open(&config.database_path())?;
        db.migrate()?;
        tracing::info!(
            path = %config.database_path().display(),
            endpoint = %transport.base_url(),
            "Opened tracking database"
        );
        Self::with_transport(config, Arc::new(db), transport)
    }

    /// Build on an already migrated database with a custom transport.
    pub fn with_transport<T: Transport>(
        config: Config,
        db: Arc<Database>,
        transport: T,
    ) -> Result<Self> {
        config.api.validate()?;
        let queue = Arc::new(EventQueue::new(db.clone(), config.api.max_queue_size));
        let dispatcher = Dispatcher::spawn(queue, transport, DispatchSettings::from(&config.api))?;
        Ok(Self {
            store: PersistentStore::new(db),
            dispatcher: Arc::new(dispatcher),
            trackers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// The tracker for `token`, using the configured opt-out default.
    pub fn instance(&self, token: &str) -> Arc<Tracker> {
        self.instance_with(token, self.config.tracking.opt_out_default, None)
    }

    /// The tracker for `token`. `opt_out_default` and `super_properties`
    /// only apply when the tracker is created by this call.
    pub fn instance_with(
        &self,
        token: &str,
        opt_out_default: bool,
        super_properties: Option<Properties>,
    ) -> Arc<Tracker> {
        if token.is_empty() {
            tracing::warn!("Creating a tracker with an empty token");
        }
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        trackers
            .entry(token.to_string())
            .or_insert_with(|| {
                Arc::new(Tracker::new(
                    token,
                    &self.config,
                    self.store.clone(),
                    self.dispatcher.clone(),
                    opt_out_default,
                    super_properties,
                ))
            })
            .clone()
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop the worker. Trackers stay usable for enqueueing; nothing is
    /// sent until a new registry is opened.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
