//! End-to-end tests of the track, queue and flush pipeline through the
//! public API, with a fake transport in place of HTTP.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mmp_core::config::{ApiConfig, TrackingConfig};
use mmp_core::{Config, Database, Error, MessageKind, Registry, Result, TransmitOutcome, Transport};

const WAIT: Duration = Duration::from_secs(5);

/// Answers batches from a script, then accepts everything.
#[derive(Default)]
struct FakeTransport {
    script: Mutex<VecDeque<TransmitOutcome>>,
    sent: Mutex<Vec<(MessageKind, serde_json::Value)>>,
}

impl FakeTransport {
    fn scripted(outcomes: Vec<TransmitOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            ..Default::default()
        })
    }

    fn offline() -> Arc<Self> {
        Self::scripted(vec![transient(); 64])
    }

    fn event_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Events)
            .flat_map(|(_, batch)| batch.as_array().cloned().unwrap_or_default())
            .map(|msg| msg["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl Transport for FakeTransport {
    async fn send_batch(&self, kind: MessageKind, data: &str) -> TransmitOutcome {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransmitOutcome::Accepted);
        if outcome == TransmitOutcome::Accepted {
            let batch = serde_json::from_str(data).unwrap();
            self.sent.lock().unwrap().push((kind, batch));
        }
        outcome
    }

    async fn fetch_decide(&self, _token: &str, _distinct_id: &str) -> Result<serde_json::Value> {
        Err(Error::Transport("decide disabled in tests".to_string()))
    }
}

fn transient() -> TransmitOutcome {
    TransmitOutcome::TransientFailure {
        reason: "HTTP 503".to_string(),
        retry_after: None,
    }
}

fn test_config(max_queue_size: usize) -> Config {
    Config {
        api: ApiConfig {
            flush_interval_secs: 3600,
            max_queue_size,
            disable_decide: true,
            ..Default::default()
        },
        tracking: TrackingConfig {
            track_automatic_events: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn memory_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn open_registry(config: Config, transport: Arc<FakeTransport>) -> Registry {
    Registry::with_transport(config, memory_db(), transport).unwrap()
}

#[test]
fn test_tracked_events_are_delivered_on_flush() {
    let transport = FakeTransport::scripted(Vec::new());
    let registry = open_registry(test_config(1000), transport.clone());
    let tracker = registry.instance("tok");

    tracker.identify("user-1");
    tracker.track("Signed Up", [("plan", "pro")].into_iter().collect());
    let report = tracker.flush_blocking(WAIT).expect("flush finished");

    assert_eq!(report.sent, 2);
    assert!(!report.failed);
    assert_eq!(registry.dispatcher().queue().size("tok"), 0);
    assert_eq!(transport.event_names(), vec!["$identify", "Signed Up"]);

    let sent = transport.sent.lock().unwrap();
    let signed_up = &sent[0].1[1]["properties"];
    assert_eq!(signed_up["plan"], "pro");
    assert_eq!(signed_up["distinct_id"], "user-1");
    assert_eq!(signed_up["token"], "tok");
}

#[test]
fn test_full_batch_flushes_without_explicit_request() {
    let transport = FakeTransport::scripted(Vec::new());
    let mut config = test_config(1000);
    config.api.batch_size = 2;
    let registry = open_registry(config, transport.clone());
    let tracker = registry.instance("tok");

    tracker.track("a", Default::default());
    tracker.track("b", Default::default());

    let deadline = Instant::now() + WAIT;
    while registry.dispatcher().queue().size("tok") > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(transport.event_names(), vec!["a", "b"]);
    assert_eq!(registry.dispatcher().queue().size("tok"), 0);
}

#[test]
fn test_events_are_sent_in_fifo_order() {
    let transport = FakeTransport::scripted(Vec::new());
    let registry = open_registry(test_config(1000), transport.clone());
    let tracker = registry.instance("tok");

    for name in ["first", "second", "third", "fourth"] {
        tracker.track(name, Default::default());
    }
    tracker.flush_blocking(WAIT).expect("flush finished");

    assert_eq!(transport.event_names(), vec!["first", "second", "third", "fourth"]);
}

#[test]
fn test_permanent_rejection_drops_the_batch() {
    let transport = FakeTransport::scripted(vec![TransmitOutcome::PermanentRejection(
        "HTTP 400".to_string(),
    )]);
    let registry = open_registry(test_config(1000), transport.clone());
    let tracker = registry.instance("tok");

    tracker.track("bad", Default::default());
    let report = tracker.flush_blocking(WAIT).expect("flush finished");

    assert_eq!(report.dropped, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(registry.dispatcher().queue().size("tok"), 0);
    assert!(transport.event_names().is_empty());
    assert_eq!(registry.dispatcher().stats().records_dropped, 1);
}

#[test]
fn test_transient_failure_keeps_records_queued() {
    let transport = FakeTransport::scripted(vec![transient()]);
    let registry = open_registry(test_config(1000), transport.clone());
    let tracker = registry.instance("tok");

    tracker.track("retry me", Default::default());
    let report = tracker.flush_blocking(WAIT).expect("flush finished");

    assert!(report.failed);
    assert_eq!(report.sent, 0);
    assert_eq!(registry.dispatcher().queue().size("tok"), 1);
    assert_eq!(registry.dispatcher().stats().failures, 1);
}

#[test]
fn test_queue_ceiling_keeps_newest_records() {
    let transport = FakeTransport::offline();
    let registry = Registry::with_transport(test_config(3), memory_db(), transport).unwrap();
    let tracker = registry.instance("tok");

    for i in 1..=5 {
        tracker.track(&format!("event-{}", i), Default::default());
    }

    let queue = registry.dispatcher().queue();
    assert_eq!(queue.size("tok"), 3);
    assert_eq!(queue.evicted(), 2);
    let names: Vec<String> = queue
        .peek_batch("tok", MessageKind::Events, 10)
        .iter()
        .map(|r| {
            let msg: serde_json::Value = serde_json::from_str(&r.payload).unwrap();
            msg["event"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, vec!["event-3", "event-4", "event-5"]);
}

#[test]
fn test_opt_out_empties_the_queue_and_blocks_tracking() {
    let transport = FakeTransport::offline();
    let registry = Registry::with_transport(test_config(1000), memory_db(), transport).unwrap();
    let tracker = registry.instance("tok");

    tracker.track("before", Default::default());
    assert_eq!(registry.dispatcher().queue().size("tok"), 1);

    tracker.opt_out_tracking();
    tracker.track("after", Default::default());

    assert!(tracker.has_opted_out_tracking());
    assert_eq!(registry.dispatcher().queue().size("tok"), 0);
}

#[test]
fn test_queued_records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmp.db");
    let open = || {
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    };

    {
        let registry =
            Registry::with_transport(test_config(1000), open(), FakeTransport::offline()).unwrap();
        let tracker = registry.instance("tok");
        tracker.identify("user-9");
        tracker.track("offline", Default::default());
        registry.shutdown();
    }

    let transport = FakeTransport::scripted(Vec::new());
    let registry = Registry::with_transport(test_config(1000), open(), transport.clone()).unwrap();
    let tracker = registry.instance("tok");
    assert_eq!(tracker.get_distinct_id(), "user-9");

    tracker.track("online", Default::default());
    tracker.flush_blocking(WAIT).expect("flush finished");

    assert_eq!(transport.event_names(), vec!["$identify", "offline", "online"]);
    assert_eq!(registry.dispatcher().queue().size("tok"), 0);
}
