use std::sync::Arc;
use std::time::Duration;

use numbox_core::ClassConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::fetch::StatusFetcher;
use crate::model::{OperationStatus, Payload, TrackedOperation};

/// Lower bound on the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence and hard stop of one polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Measured from the start of polling, not from the operation's creation.
    pub hard_timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, hard_timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            hard_timeout,
        }
    }

    pub fn for_class(class: &ClassConfig) -> Self {
        Self::new(class.poll_interval, class.hard_timeout)
    }
}

/// Lifecycle of a poll task.
///
/// ```text
/// Idle → Polling → StoppedTerminal
///                → StoppedTimeout
///                → StoppedCancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    Idle,
    Polling,
    StoppedTerminal,
    StoppedTimeout,
    StoppedCancelled,
}

impl PollerPhase {
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Self::StoppedTerminal | Self::StoppedTimeout | Self::StoppedCancelled
        )
    }
}

/// Emitted whenever a poll observes something new.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub operation_id: String,
    pub status: OperationStatus,
    pub payload: Payload,
    pub changed: bool,
    /// Delivered code, present on the single event that first carries it.
    pub newly_delivered: Option<String>,
}

pub type ChangeCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Final state of a poll task.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub phase: PollerPhase,
    pub operation: TrackedOperation,
    pub fetches: u32,
    pub failures: u32,
    pub elapsed: Duration,
}

/// Handle to a running poll task.
pub struct PollHandle {
    operation: TrackedOperation,
    cancel: CancellationToken,
    phase: watch::Receiver<PollerPhase>,
    join: JoinHandle<PollOutcome>,
}

impl PollHandle {
    /// Stop polling. Idempotent, and harmless once the task has ended.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> PollerPhase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase transition.
    pub fn phase_watch(&self) -> watch::Receiver<PollerPhase> {
        self.phase.clone()
    }

    pub async fn wait(self) -> PollOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(operation_id = %self.operation.operation_id, "poll task aborted: {e}");
                PollOutcome {
                    phase: PollerPhase::StoppedCancelled,
                    operation: self.operation,
                    fetches: 0,
                    failures: 0,
                    elapsed: Duration::ZERO,
                }
            }
        }
    }
}

/// Start polling `operation` with a fresh cancellation token.
pub fn begin_polling(
    operation: TrackedOperation,
    fetcher: Arc<dyn StatusFetcher>,
    config: PollConfig,
    on_change: ChangeCallback,
) -> PollHandle {
    begin_polling_with_token(operation, fetcher, config, on_change, CancellationToken::new())
}

/// Start polling under a caller-provided token, typically a child of a
/// wider scope so cancelling the scope stops the poller too.
pub fn begin_polling_with_token(
    operation: TrackedOperation,
    fetcher: Arc<dyn StatusFetcher>,
    config: PollConfig,
    on_change: ChangeCallback,
    cancel: CancellationToken,
) -> PollHandle {
    let config = PollConfig::new(config.interval, config.hard_timeout);
    let (phase_tx, phase_rx) = watch::channel(PollerPhase::Idle);

    let join = tokio::spawn(poll_loop(
        operation.clone(),
        fetcher,
        config,
        on_change,
        cancel.clone(),
        phase_tx,
    ));

    PollHandle {
        operation,
        cancel,
        phase: phase_rx,
        join,
    }
}

async fn poll_loop(
    mut operation: TrackedOperation,
    fetcher: Arc<dyn StatusFetcher>,
    config: PollConfig,
    on_change: ChangeCallback,
    cancel: CancellationToken,
    phase_tx: watch::Sender<PollerPhase>,
) -> PollOutcome {
    let started = Instant::now();
    let deadline = started + config.hard_timeout;
    let mut fetches = 0u32;
    let mut failures = 0u32;

    let phase = if operation.is_terminal() {
        PollerPhase::StoppedTerminal
    } else {
        phase_tx.send_replace(PollerPhase::Polling);
        info!(
            operation_id = %operation.operation_id,
            "polling started (interval={:?}, timeout={:?})",
            config.interval,
            config.hard_timeout
        );

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let polling = async {
            loop {
                ticker.tick().await;
                fetches += 1;
                match fetcher.fetch_status(&operation.operation_id).await {
                    Ok(report) => {
                        let rec = operation.reconcile(report);
                        if rec.changed {
                            on_change(&StateChange {
                                operation_id: operation.operation_id.clone(),
                                status: operation.last_known_state,
                                payload: operation.payload.clone(),
                                changed: true,
                                newly_delivered: rec.newly_delivered,
                            });
                        }
                        if operation.is_terminal() {
                            break PollerPhase::StoppedTerminal;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(operation_id = %operation.operation_id, "status fetch failed: {e}");
                    }
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => PollerPhase::StoppedCancelled,
            _ = tokio::time::sleep_until(deadline) => PollerPhase::StoppedTimeout,
            phase = polling => phase,
        }
    };

    info!(
        operation_id = %operation.operation_id,
        status = %operation.last_known_state,
        "polling stopped: {phase:?} after {fetches} fetches ({failures} failed)"
    );
    phase_tx.send_replace(phase);

    PollOutcome {
        phase,
        operation,
        fetches,
        failures,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, FnFetcher};
    use crate::model::StatusReport;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn operation() -> TrackedOperation {
        TrackedOperation::new("op1", 0, Duration::from_secs(900))
    }

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<StateChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ChangeCallback = Arc::new(move |c: &StateChange| sink.lock().unwrap().push(c.clone()));
        (cb, seen)
    }

    /// Replies with `script[n]` on the n-th call, repeating the last entry.
    fn scripted(script: Vec<StatusReport>) -> (Arc<dyn StatusFetcher>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let script = Arc::new(script);
        let fetcher = FnFetcher::new(move |_id: String| {
            let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
            let script = Arc::clone(&script);
            async move { Ok(script[n.min(script.len() - 1)].clone()) }
        });
        (Arc::new(fetcher), calls)
    }

    #[test]
    fn interval_is_clamped() {
        let config = PollConfig::new(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(config.interval, MIN_POLL_INTERVAL);
        assert!(PollerPhase::StoppedTimeout.is_stopped());
        assert!(!PollerPhase::Polling.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_terminal_status() {
        let (fetcher, calls) = scripted(vec![
            StatusReport::pending(),
            StatusReport::new(OperationStatus::Processing, json!(null)),
            StatusReport::new(OperationStatus::Success, json!({"code": "482913"})),
        ]);
        let (cb, seen) = recorder();

        let handle = begin_polling(
            operation(),
            fetcher,
            PollConfig::new(Duration::from_secs(10), Duration::from_secs(900)),
            cb,
        );
        let outcome = handle.wait().await;

        assert_eq!(outcome.phase, PollerPhase::StoppedTerminal);
        assert_eq!(outcome.fetches, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.elapsed, Duration::from_secs(20));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, OperationStatus::Processing);
        assert_eq!(seen[1].newly_delivered.as_deref(), Some("482913"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_during_outstanding_fetch() {
        let fetcher = FnFetcher::new(|_id: String| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StatusReport::pending())
        });
        let (cb, seen) = recorder();

        let handle = begin_polling(
            operation(),
            Arc::new(fetcher),
            PollConfig::new(Duration::from_secs(3), Duration::from_secs(60)),
            cb,
        );
        let outcome = handle.wait().await;

        assert_eq!(outcome.phase, PollerPhase::StoppedTimeout);
        assert_eq!(outcome.fetches, 1);
        assert_eq!(outcome.elapsed, Duration::from_secs(60));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetches_never_overlap() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let (f, m) = (Arc::clone(&in_flight), Arc::clone(&max_seen));
        let fetcher = FnFetcher::new(move |_id: String| {
            let (f, m) = (Arc::clone(&f), Arc::clone(&m));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(25)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(StatusReport::pending())
            }
        });
        let (cb, _seen) = recorder();

        let outcome = begin_polling(
            operation(),
            Arc::new(fetcher),
            PollConfig::new(Duration::from_secs(10), Duration::from_secs(100)),
            cb,
        )
        .wait()
        .await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        // Fetches start at 0, 25, 50, 75: one late tick fires, the rest are dropped.
        assert_eq!(outcome.fetches, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_absorbed() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let fetcher = FnFetcher::new(move |_id: String| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::Unavailable("offline".into()))
                } else {
                    Ok(StatusReport::new(OperationStatus::Failed, json!({"reason": "expired"})))
                }
            }
        });
        let (cb, seen) = recorder();

        let outcome = begin_polling(
            operation(),
            Arc::new(fetcher),
            PollConfig::new(Duration::from_secs(5), Duration::from_secs(60)),
            cb,
        )
        .wait()
        .await;

        assert_eq!(outcome.phase, PollerPhase::StoppedTerminal);
        assert_eq!(outcome.failures, 2);
        assert_eq!(outcome.fetches, 3);
        assert_eq!(outcome.operation.last_known_state, OperationStatus::Failed);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_observable() {
        let (fetcher, _calls) = scripted(vec![StatusReport::pending()]);
        let (cb, _seen) = recorder();

        let handle = begin_polling(
            operation(),
            fetcher,
            PollConfig::new(Duration::from_secs(10), Duration::from_secs(900)),
            cb,
        );
        let mut phases = handle.phase_watch();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.phase(), PollerPhase::Polling);

        handle.cancel();
        handle.cancel();
        phases.wait_for(|p| p.is_stopped()).await.unwrap();
        assert_eq!(*phases.borrow(), PollerPhase::StoppedCancelled);

        let outcome = handle.wait().await;
        assert_eq!(outcome.phase, PollerPhase::StoppedCancelled);
        assert_eq!(outcome.fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn already_terminal_never_fetches() {
        let mut op = operation();
        op.reconcile(StatusReport::new(OperationStatus::Success, json!(null)));
        let (fetcher, calls) = scripted(vec![StatusReport::pending()]);
        let (cb, _seen) = recorder();

        let handle = begin_polling(op, fetcher, PollConfig::new(Duration::from_secs(1), Duration::from_secs(5)), cb);
        let outcome = handle.wait().await;
        assert_eq!(outcome.phase, PollerPhase::StoppedTerminal);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_natural_end_is_harmless() {
        let (fetcher, _calls) = scripted(vec![StatusReport::new(OperationStatus::Failed, json!(null))]);
        let (cb, _seen) = recorder();
        let handle = begin_polling(operation(), fetcher, PollConfig::new(Duration::from_secs(1), Duration::from_secs(5)), cb);
        let token = handle.cancel_token();
        let outcome = handle.wait().await;
        token.cancel();
        assert_eq!(outcome.phase, PollerPhase::StoppedTerminal);
    }
}
