//! Background delivery of queued messages
//!
//! A single dedicated thread hosts a current-thread tokio runtime and owns
//! every network call. Callers talk to it through a command channel, so
//! tracking never blocks on I/O. The worker cycles through
//! `Idle → Batching → Sending → (Idle | Backoff → Idle)`.

pub mod transport;
mod worker;

use std::fmt;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ApiConfig;
use crate::decide::DecideClient;
use crate::error::Result;
use crate::queue::EventQueue;

pub use transport::{classify_response, HttpTransport, TransmitOutcome, Transport};
pub use worker::{backoff_delay, encode_batch};

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherState {
    #[default]
    Idle,
    Batching,
    Sending,
    Backoff,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Batching => "batching",
            DispatcherState::Sending => "sending",
            DispatcherState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// A request to flush one token, consumed once by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushDescriptor {
    pub token: String,
    /// Also refresh the token's decide cache if it is stale
    pub check_decide: bool,
}

impl FlushDescriptor {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            check_decide: false,
        }
    }

    pub fn with_decide_check(mut self) -> Self {
        self.check_decide = true;
        self
    }
}

/// Outcome of one flush request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub token: String,
    /// Records accepted by the server
    pub sent: usize,
    /// Records permanently rejected and removed
    pub dropped: usize,
    /// A transient failure stopped the flush; the rest stays queued
    pub failed: bool,
}

impl FlushReport {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            ..Default::default()
        }
    }
}

/// Delivery statistics since startup
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches_sent: u64,
    pub records_sent: u64,
    pub records_dropped: u64,
    /// Transient failures
    pub failures: u64,
    pub decide_fetches: u64,
}

/// Worker tuning taken from [`ApiConfig`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub decide_interval: Duration,
    pub disable_decide: bool,
}

impl From<&ApiConfig> for DispatchSettings {
    fn from(api: &ApiConfig) -> Self {
        Self {
            batch_size: api.batch_size,
            flush_interval: api.flush_interval(),
            backoff_base: Duration::from_secs(api.backoff_base_secs),
            backoff_max: Duration::from_secs(api.backoff_max_secs),
            decide_interval: api.decide_interval(),
            disable_decide: api.disable_decide,
        }
    }
}

pub(crate) enum Command {
    Flush(FlushDescriptor, Option<std::sync::mpsc::SyncSender<FlushReport>>),
    InstallDecide(Arc<DecideClient>),
    Shutdown,
}

#[derive(Default)]
pub(crate) struct Shared {
    state: Mutex<DispatcherState>,
    stats: Mutex<DispatchStats>,
}

impl Shared {
    fn set_state(&self, state: DispatcherState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to the delivery worker shared by every tracker.
pub struct Dispatcher {
    queue: Arc<EventQueue>,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the worker thread.
    pub fn spawn<T: Transport>(
        queue: Arc<EventQueue>,
        transport: T,
        settings: DispatchSettings,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let worker = worker::Worker::new(queue.clone(), transport, settings, shared.clone());

        let handle = std::thread::Builder::new()
            .name("mmp-dispatcher".to_string())
            .spawn(move || runtime.block_on(worker.run(rx)))?;

        Ok(Self {
            queue,
            commands,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            tracing::warn!("Dispatcher is shut down, dropping command");
            return false;
        }
        true
    }

    /// Request a flush and return immediately.
    pub fn flush(&self, descriptor: FlushDescriptor) {
        self.send(Command::Flush(descriptor, None));
    }

    /// Request a flush and wait up to `timeout` for it to finish.
    ///
    /// Returns `None` on timeout; unsent data stays queued. Blocks the
    /// calling thread, so do not call it from inside an async task.
    pub fn flush_blocking(
        &self,
        descriptor: FlushDescriptor,
        timeout: Duration,
    ) -> Option<FlushReport> {
        let (tx, rx) = sync_channel(1);
        if !self.send(Command::Flush(descriptor, Some(tx))) {
            return None;
        }
        rx.recv_timeout(timeout).ok()
    }

    /// Drop every queued record of `token` without going through the worker.
    pub fn empty_tracking_queues(&self, token: &str) -> usize {
        self.queue.clear(token)
    }

    /// Have the worker keep `client` refreshed.
    pub fn install_decide_check(&self, client: Arc<DecideClient>) {
        self.send(Command::InstallDecide(client));
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Stop the worker after its current batch and join the thread.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if handle.join().is_err() {
            tracing::error!("Dispatcher worker panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport shared by unit and facade tests

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::transport::{TransmitOutcome, Transport};
    use crate::error::{Error, Result};
    use crate::types::MessageKind;

    #[derive(Default)]
    pub struct ScriptedTransport {
        outcomes: Mutex<VecDeque<TransmitOutcome>>,
        sent: Mutex<Vec<(MessageKind, serde_json::Value)>>,
        decide: Mutex<Option<serde_json::Value>>,
        offline: bool,
    }

    impl ScriptedTransport {
        /// Fails every send transiently, so records stay queued.
        pub fn offline() -> Self {
            Self {
                offline: true,
                ..Default::default()
            }
        }

        /// Queue outcomes for the next sends; `Accepted` once exhausted.
        pub fn script(&self, outcomes: impl IntoIterator<Item = TransmitOutcome>) {
            self.outcomes.lock().unwrap().extend(outcomes);
        }

        pub fn set_decide(&self, document: serde_json::Value) {
            *self.decide.lock().unwrap() = Some(document);
        }

        /// Every batch posted so far, decoded.
        pub fn sent(&self) -> Vec<(MessageKind, serde_json::Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send_batch(&self, kind: MessageKind, data: &str) -> TransmitOutcome {
            if self.offline {
                return TransmitOutcome::TransientFailure {
                    reason: "offline".to_string(),
                    retry_after: None,
                };
            }
            let batch = serde_json::from_str(data).unwrap();
            self.sent.lock().unwrap().push((kind, batch));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TransmitOutcome::Accepted)
        }

        async fn fetch_decide(
            &self,
            _token: &str,
            _distinct_id: &str,
        ) -> Result<serde_json::Value> {
            self.decide
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::Transport("no decide document".to_string()))
        }
    }
}
