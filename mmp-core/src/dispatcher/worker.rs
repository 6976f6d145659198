//! The delivery loop running on the dispatcher thread

use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, MissedTickBehavior};

use crate::decide::DecideClient;
use crate::queue::{EventQueue, QueueRecord};
use crate::types::MessageKind;

use super::transport::{TransmitOutcome, Transport};
use super::{Command, DispatchSettings, DispatcherState, FlushDescriptor, FlushReport, Shared};

type PendingFlush = (FlushDescriptor, Option<SyncSender<FlushReport>>);

/// Delay before the next attempt after `failures` consecutive transient
/// failures (`failures >= 1`).
pub fn backoff_delay(
    base: Duration,
    max: Duration,
    failures: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent).min(max);
    match retry_after {
        Some(server) if server > delay => server,
        _ => delay,
    }
}

/// Join stored wire payloads into one JSON array.
pub fn encode_batch(records: &[QueueRecord]) -> String {
    let capacity = records.iter().map(|r| r.payload.len() + 1).sum::<usize>() + 2;
    let mut data = String::with_capacity(capacity);
    data.push('[');
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            data.push(',');
        }
        data.push_str(&record.payload);
    }
    data.push(']');
    data
}

pub(super) struct Worker<T> {
    queue: Arc<EventQueue>,
    transport: T,
    settings: DispatchSettings,
    shared: Arc<Shared>,
    decide: HashMap<String, Arc<DecideClient>>,
    failures: u32,
    backoff_until: Option<Instant>,
    deferred: Vec<PendingFlush>,
}

impl<T: Transport> Worker<T> {
    pub(super) fn new(
        queue: Arc<EventQueue>,
        transport: T,
        settings: DispatchSettings,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            queue,
            transport,
            settings,
            shared,
            decide: HashMap::new(),
            failures: 0,
            backoff_until: None,
            deferred: Vec::new(),
        }
    }

    pub(super) async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        let period = self.settings.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            flush_interval_secs = period.as_secs(),
            batch_size = self.settings.batch_size,
            "Dispatcher worker started"
        );

        loop {
            let backoff = self.backoff_until;
            let wake = backoff.unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Flush(descriptor, reply)) => {
                        if backoff.is_some() {
                            tracing::debug!(
                                token = %descriptor.token,
                                "Deferring flush until backoff ends"
                            );
                            self.deferred.push((descriptor, reply));
                        } else {
                            self.handle_flush(descriptor, reply).await;
                        }
                    }
                    Some(Command::InstallDecide(client)) => {
                        self.decide.insert(client.token().to_string(), client);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    if backoff.is_none() {
                        self.flush_all().await;
                        self.refresh_all_decide().await;
                    }
                }
                _ = tokio::time::sleep_until(wake), if backoff.is_some() => {
                    self.backoff_until = None;
                    self.shared.set_state(DispatcherState::Idle);
                    tracing::debug!(deferred = self.deferred.len(), "Backoff ended");
                    self.run_deferred().await;
                }
            }
        }

        self.shared.set_state(DispatcherState::Idle);
        tracing::debug!("Dispatcher worker stopped");
    }

    async fn handle_flush(
        &mut self,
        descriptor: FlushDescriptor,
        reply: Option<SyncSender<FlushReport>>,
    ) {
        let report = self.flush_token(&descriptor.token).await;
        if descriptor.check_decide {
            if let Some(client) = self.decide.get(&descriptor.token).cloned() {
                if client.needs_refresh(self.settings.decide_interval) {
                    self.refresh_decide(&client).await;
                }
            }
        }
        if let Some(reply) = reply {
            // The caller may have timed out already
            let _ = reply.try_send(report);
        }
    }

    async fn run_deferred(&mut self) {
        let pending = std::mem::take(&mut self.deferred);
        let mut iter = pending.into_iter();
        while let Some((descriptor, reply)) = iter.next() {
            self.handle_flush(descriptor, reply).await;
            if self.backoff_until.is_some() {
                // Failed again; keep the rest for the next window
                self.deferred.extend(iter);
                return;
            }
        }
    }

    async fn flush_all(&mut self) {
        for token in self.queue.tokens() {
            self.flush_token(&token).await;
            if self.backoff_until.is_some() {
                break;
            }
        }
    }

    /// Drain every kind of `token` until empty or a transient failure.
    async fn flush_token(&mut self, token: &str) -> FlushReport {
        let mut report = FlushReport::new(token);
        if self.backoff_until.is_some() {
            report.failed = true;
            return report;
        }

        for kind in MessageKind::ALL {
            loop {
                let batch = self.queue.peek_batch(token, kind, self.settings.batch_size);
                let Some(last_seq) = batch.last().map(|r| r.seq) else {
                    break;
                };
                self.shared.set_state(DispatcherState::Batching);
                let data = encode_batch(&batch);

                self.shared.set_state(DispatcherState::Sending);
                let outcome = self.transport.send_batch(kind, &data).await;

                match outcome {
                    TransmitOutcome::Accepted => {
                        let removed = self.queue.remove_up_to(token, kind, last_seq);
                        self.failures = 0;
                        report.sent += batch.len();
                        self.shared.record(|s| {
                            s.batches_sent += 1;
                            s.records_sent += batch.len() as u64;
                        });
                        tracing::debug!(
                            token = %token,
                            kind = %kind,
                            count = batch.len(),
                            "Batch accepted"
                        );
                        if removed == 0 {
                            tracing::error!(
                                token = %token,
                                kind = %kind,
                                "Sent records could not be removed"
                            );
                            break;
                        }
                    }
                    TransmitOutcome::PermanentRejection(reason) => {
                        let removed = self.queue.remove_up_to(token, kind, last_seq);
                        self.failures = 0;
                        report.dropped += batch.len();
                        self.shared.record(|s| s.records_dropped += batch.len() as u64);
                        tracing::warn!(
                            token = %token,
                            kind = %kind,
                            count = batch.len(),
                            reason = %reason,
                            "Batch rejected, dropping records"
                        );
                        if removed == 0 {
                            tracing::error!(
                                token = %token,
                                kind = %kind,
                                "Rejected records could not be removed"
                            );
                            break;
                        }
                    }
                    TransmitOutcome::TransientFailure { reason, retry_after } => {
                        report.failed = true;
                        self.enter_backoff(token, kind, &reason, retry_after);
                        return report;
                    }
                }
            }
        }

        self.shared.set_state(DispatcherState::Idle);
        report
    }

    fn enter_backoff(
        &mut self,
        token: &str,
        kind: MessageKind,
        reason: &str,
        retry_after: Option<Duration>,
    ) {
        self.failures += 1;
        let delay = backoff_delay(
            self.settings.backoff_base,
            self.settings.backoff_max,
            self.failures,
            retry_after,
        );
        self.backoff_until = Some(Instant::now() + delay);
        self.shared.set_state(DispatcherState::Backoff);
        self.shared.record(|s| s.failures += 1);
        tracing::warn!(
            token = %token,
            kind = %kind,
            reason = %reason,
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Transient delivery failure, backing off"
        );
    }

    async fn refresh_all_decide(&mut self) {
        if self.settings.disable_decide {
            return;
        }
        let due: Vec<Arc<DecideClient>> = self
            .decide
            .values()
            .filter(|c| c.needs_refresh(self.settings.decide_interval))
            .cloned()
            .collect();
        for client in due {
            self.refresh_decide(&client).await;
        }
    }

    async fn refresh_decide(&mut self, client: &DecideClient) {
        if self.settings.disable_decide {
            return;
        }
        let distinct_id = client.distinct_id();
        if distinct_id.is_empty() {
            return;
        }
        match self.transport.fetch_decide(client.token(), &distinct_id).await {
            Ok(document) => {
                client.apply_response(&distinct_id, &document);
                self.shared.record(|s| s.decide_fetches += 1);
            }
            Err(e) => {
                client.mark_fetch_failed();
                tracing::warn!(token = %client.token(), error = %e, "Decide fetch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(base, max, 1, None), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 2, None), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, max, 4, None), Duration::from_secs(480));
        assert_eq!(backoff_delay(base, max, 5, None), max);
        assert_eq!(backoff_delay(base, max, 90, None), max);
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        let raised = backoff_delay(base, max, 1, Some(Duration::from_secs(900)));
        assert_eq!(raised, Duration::from_secs(900));
        let kept = backoff_delay(base, max, 2, Some(Duration::from_secs(5)));
        assert_eq!(kept, Duration::from_secs(120));
    }

    #[test]
    fn test_encode_batch_joins_payloads() {
        let record = |seq: i64, payload: &str| QueueRecord {
            token: "t".to_string(),
            seq,
            kind: MessageKind::Events,
            payload: payload.to_string(),
            created_at: Utc::now(),
        };
        let data = encode_batch(&[record(1, "{\"a\":1}"), record(2, "{\"b\":2}")]);
        assert_eq!(data, "[{\"a\":1},{\"b\":2}]");
        let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(encode_batch(&[]), "[]");
    }
}
