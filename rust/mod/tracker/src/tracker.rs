use std::sync::Arc;
use std::time::Duration;

use numbox_core::{Clock, OperationKind, TrackerConfig};
use numbox_kv::KVStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::fetch::StatusFetcher;
use crate::model::{DeadlineRecord, TrackedOperation};
use crate::notifier::Notifier;
use crate::poller::{self, ChangeCallback, PollConfig, PollHandle, PollOutcome, PollerPhase, StateChange};
use crate::sink::{StateSink, StatusView, TimerView, ViewUpdate};
use crate::timer::{Countdown, CountdownEnd, ExpiryTimer, EXPIRED_TEXT};

/// Why a mounted tracker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEnd {
    /// The operation reached SUCCESS or FAILED.
    Resolved,
    /// Polling hit its hard timeout before the deadline. The countdown is
    /// stopped with it and the view shows the expired state.
    TimedOut,
    /// The countdown reached zero.
    Expired,
    /// Unmounted while still live.
    Unmounted,
}

#[derive(Debug, Clone)]
pub struct TrackerOutcome {
    pub operation: TrackedOperation,
    pub end: TrackerEnd,
    pub fetches: u32,
}

/// Mounts one countdown and one poller per operation and keeps them in step.
pub struct OperationTracker {
    timer: ExpiryTimer,
    notifier: Arc<Notifier>,
    sink: Arc<dyn StateSink>,
    config: TrackerConfig,
}

impl OperationTracker {
    pub fn new(
        store: Arc<dyn KVStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<Notifier>,
        sink: Arc<dyn StateSink>,
        config: TrackerConfig,
    ) -> Self {
        let timer = ExpiryTimer::new(store, clock).with_retention(config.sweep.retention());
        Self {
            timer,
            notifier,
            sink,
            config,
        }
    }

    pub fn timer(&self) -> &ExpiryTimer {
        &self.timer
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking an operation.
    ///
    /// `created_at` defaults to now. A restored deadline record always wins
    /// over it, and polling never runs past the remaining countdown.
    pub fn mount(
        &self,
        operation_id: &str,
        kind: OperationKind,
        created_at: Option<i64>,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> TrackerHandle {
        let class = self.config.class(kind);
        let now = self.timer.clock().now_millis();

        let countdown = self
            .timer
            .start(operation_id, created_at.unwrap_or(now), class.budget);
        let record = countdown.record();
        let remaining = Duration::from_millis(record.remaining_ms(now).max(0) as u64);
        let hard_timeout = class.hard_timeout.min(remaining);

        let scope = CancellationToken::new();
        let countdown = countdown.with_cancel_token(scope.child_token());

        let operation = TrackedOperation::new(
            operation_id,
            record.created_at,
            Duration::from_millis(record.duration_ms as u64),
        )
        .with_notified(self.timer.was_notified(operation_id));

        let on_change: ChangeCallback = {
            let sink = Arc::clone(&self.sink);
            let notifier = Arc::clone(&self.notifier);
            let timer = self.timer.clone();
            let notify = class.notify;
            Arc::new(move |change: &StateChange| {
                sink.publish(
                    &change.operation_id,
                    ViewUpdate::Status(StatusView {
                        status: change.status,
                        payload: change.payload.clone(),
                        changed: change.changed,
                    }),
                );
                if change.newly_delivered.is_none() {
                    return;
                }
                timer.mark_notified(&change.operation_id);
                if notify {
                    let outcome = notifier.notify();
                    info!(operation_id = %change.operation_id, "delivery cue: {outcome:?}");
                }
            })
        };

        let poll = poller::begin_polling_with_token(
            operation.clone(),
            fetcher,
            PollConfig::new(class.poll_interval, hard_timeout),
            on_change,
            scope.child_token(),
        );

        info!(
            operation_id,
            kind = %kind,
            remaining_ms = record.remaining_ms(now),
            "tracker mounted"
        );

        let join = tokio::spawn(supervise(
            operation_id.to_string(),
            self.timer.clone(),
            record,
            countdown,
            poll,
            Arc::clone(&self.sink),
        ));

        TrackerHandle {
            operation,
            scope,
            join,
        }
    }
}

/// Waits for both cadences and applies the "first to finish wins" rules:
/// a terminal poll or a poll timeout stops the countdown and drops the
/// record; an expired countdown stops the poller. A timeout that lands on
/// the deadline itself is left to the countdown and ends as `Expired`.
async fn supervise(
    operation_id: String,
    timer: ExpiryTimer,
    record: DeadlineRecord,
    countdown: Countdown,
    poll: PollHandle,
    sink: Arc<dyn StateSink>,
) -> TrackerOutcome {
    let countdown_cancel = countdown.cancel_token();
    let poll_cancel = poll.cancel_token();

    let mut countdown_task = tokio::spawn(countdown.run(Arc::clone(&sink)));
    let poll_wait = poll.wait();
    tokio::pin!(poll_wait);

    let mut polled: Option<PollOutcome> = None;
    let mut counted: Option<CountdownEnd> = None;
    let mut timed_out = false;

    let (outcome, countdown_end) = loop {
        match (polled.take(), counted) {
            (Some(p), Some(c)) => break (p, c),
            (p, _) => polled = p,
        }

        tokio::select! {
            outcome = &mut poll_wait, if polled.is_none() => {
                match outcome.phase {
                    PollerPhase::StoppedTerminal => {
                        countdown_cancel.cancel();
                        timer.stop(&operation_id);
                    }
                    PollerPhase::StoppedTimeout
                        if counted.is_none()
                            && record.remaining_ms(timer.clock().now_millis()) > 0 =>
                    {
                        countdown_cancel.cancel();
                        timer.stop(&operation_id);
                        timed_out = true;
                    }
                    _ => {}
                }
                polled = Some(outcome);
            }
            end = &mut countdown_task, if counted.is_none() => {
                let end = end.unwrap_or_else(|e| {
                    error!(operation_id = %operation_id, "countdown task aborted: {e}");
                    CountdownEnd::Stopped
                });
                if end == CountdownEnd::Expired {
                    poll_cancel.cancel();
                }
                counted = Some(end);
            }
        }
    };

    let end = if outcome.phase == PollerPhase::StoppedTerminal {
        TrackerEnd::Resolved
    } else if countdown_end == CountdownEnd::Expired {
        TrackerEnd::Expired
    } else if timed_out {
        // Published once the countdown task is done, so no tick lands after it.
        sink.publish(
            &operation_id,
            ViewUpdate::Timer(TimerView {
                remaining_text: EXPIRED_TEXT.to_string(),
                is_expired: true,
            }),
        );
        TrackerEnd::TimedOut
    } else {
        TrackerEnd::Unmounted
    };

    info!(
        operation_id = %operation_id,
        status = %outcome.operation.last_known_state,
        "tracker finished: {end:?}"
    );

    TrackerOutcome {
        operation: outcome.operation,
        end,
        fetches: outcome.fetches,
    }
}

/// A mounted tracker.
pub struct TrackerHandle {
    operation: TrackedOperation,
    scope: CancellationToken,
    join: JoinHandle<TrackerOutcome>,
}

impl TrackerHandle {
    pub fn operation_id(&self) -> &str {
        &self.operation.operation_id
    }

    /// Cancel the countdown and the poller. Idempotent.
    ///
    /// The deadline record stays, so mounting again resumes the same countdown.
    pub fn unmount(&self) {
        if !self.scope.is_cancelled() {
            info!(operation_id = %self.operation.operation_id, "tracker unmounted");
        }
        self.scope.cancel();
    }

    /// Token that unmounts when cancelled, usable after `finished` took the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.scope.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn finished(self) -> TrackerOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(operation_id = %self.operation.operation_id, "tracker task aborted: {e}");
                TrackerOutcome {
                    operation: self.operation,
                    end: TrackerEnd::Unmounted,
                    fetches: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBackend, AudioError, ToneContext};
    use crate::clock::AnchoredClock;
    use crate::fetch::FnFetcher;
    use crate::model::{OperationStatus, StatusReport};
    use crate::prefs::NotificationPrefs;
    use crate::sink::ViewStore;
    use crate::timer::{notified_key, timer_key};
    use numbox_kv::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const T0: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct CountingClip(AtomicU32);

    impl AudioBackend for CountingClip {
        fn open_tone_context(&self) -> Result<Box<dyn ToneContext>, AudioError> {
            Err(AudioError::Unavailable("test".into()))
        }
        fn play_clip(&self, _clip: &[u8]) -> Result<(), AudioError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        views: Arc<ViewStore>,
        audio: Arc<CountingClip>,
        tracker: OperationTracker,
    }

    fn rig() -> Rig {
        rig_with(TrackerConfig::default())
    }

    fn rig_with(config: TrackerConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let views = Arc::new(ViewStore::new());
        let audio = Arc::new(CountingClip::default());
        let prefs = Arc::new(NotificationPrefs::load(store.clone()));
        let notifier = Arc::new(Notifier::new(audio.clone(), prefs));
        let tracker = OperationTracker::new(
            store.clone(),
            Arc::new(AnchoredClock::new(T0)),
            notifier,
            views.clone(),
            config,
        );
        Rig {
            store,
            views,
            audio,
            tracker,
        }
    }

    fn pending_forever() -> Arc<dyn StatusFetcher> {
        Arc::new(FnFetcher::new(|_id: String| async { Ok(StatusReport::pending()) }))
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_resolves_and_notifies_once() {
        let rig = rig();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let fetcher = FnFetcher::new(move |_id: String| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match n {
                    0 => StatusReport::pending(),
                    1 => StatusReport::new(OperationStatus::Processing, json!({"code": "482913"})),
                    _ => StatusReport::new(OperationStatus::Success, json!({"code": "482913"})),
                })
            }
        });

        let handle = rig.tracker.mount("op1", OperationKind::SmsWait, None, Arc::new(fetcher));
        let outcome = handle.finished().await;

        assert_eq!(outcome.end, TrackerEnd::Resolved);
        assert_eq!(outcome.operation.last_known_state, OperationStatus::Success);
        assert_eq!(rig.audio.0.load(Ordering::SeqCst), 1);
        assert!(rig.store.get(&timer_key("op1")).unwrap().is_none());
        assert_eq!(rig.views.status("op1").unwrap().status, OperationStatus::Success);
        assert!(rig.views.timer("op1").unwrap().remaining_text.starts_with("14:4"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_notifying_kind_stays_silent() {
        let rig = rig();
        let fetcher = FnFetcher::new(|_id: String| async {
            Ok(StatusReport::new(OperationStatus::Success, json!({"code": "1"})))
        });
        let outcome = rig
            .tracker
            .mount("pay1", OperationKind::PaymentConfirmation, None, Arc::new(fetcher))
            .finished()
            .await;
        assert_eq!(outcome.end, TrackerEnd::Resolved);
        assert_eq!(rig.audio.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_keeps_record_and_remount_resumes() {
        let rig = rig();
        let handle = rig.tracker.mount("op1", OperationKind::SmsWait, None, pending_forever());

        tokio::time::sleep(Duration::from_secs(120)).await;
        handle.unmount();
        handle.unmount();
        assert_eq!(handle.finished().await.end, TrackerEnd::Unmounted);
        assert!(rig.store.get(&timer_key("op1")).unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let handle = rig
            .tracker
            .mount("op1", OperationKind::SmsWait, Some(T0 + 180_000), pending_forever());
        let start = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.views.timer("op1").unwrap().remaining_text, "12:00");

        // Reload never grants extra polling: expiry lands at the original deadline.
        let outcome = handle.finished().await;
        assert_eq!(outcome.end, TrackerEnd::Expired);
        assert_eq!(start.elapsed(), Duration::from_secs(720));
        assert!(rig.views.timer("op1").unwrap().is_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn already_expired_record_ends_immediately() {
        let rig = rig();
        let outcome = rig
            .tracker
            .mount("old", OperationKind::NumberAssignment, Some(T0 - 600_000), pending_forever())
            .finished()
            .await;
        assert_eq!(outcome.end, TrackerEnd::Expired);
        assert_eq!(outcome.fetches, 0);
        assert_eq!(rig.views.timer("old").unwrap().remaining_text, "Expiré");
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_below_budget_stops_the_countdown() {
        let mut config = TrackerConfig::default();
        config.sms_wait.hard_timeout_secs = Some(60);
        let rig = rig_with(config);

        let start = tokio::time::Instant::now();
        let outcome = rig
            .tracker
            .mount("op1", OperationKind::SmsWait, None, pending_forever())
            .finished()
            .await;

        assert_eq!(outcome.end, TrackerEnd::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!((6..=7).contains(&outcome.fetches), "fetches = {}", outcome.fetches);
        assert_eq!(outcome.operation.last_known_state, OperationStatus::Pending);
        assert!(rig.store.get(&timer_key("op1")).unwrap().is_none());

        let view = rig.views.timer("op1").unwrap();
        assert!(view.is_expired);
        assert_eq!(view.remaining_text, EXPIRED_TEXT);

        // Nothing keeps ticking behind the timed-out view.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(rig.views.timer("op1").unwrap(), view);
    }

    #[tokio::test(start_paused = true)]
    async fn remount_after_delivery_stays_silent() {
        let rig = rig();
        let code_shown = || -> Arc<dyn StatusFetcher> {
            Arc::new(FnFetcher::new(|_id: String| async {
                Ok(StatusReport::new(OperationStatus::Processing, json!({"code": "482913"})))
            }))
        };

        let handle = rig.tracker.mount("op1", OperationKind::SmsWait, None, code_shown());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rig.audio.0.load(Ordering::SeqCst), 1);
        assert!(rig.store.get(&notified_key("op1")).unwrap().is_some());
        handle.unmount();
        assert_eq!(handle.finished().await.end, TrackerEnd::Unmounted);

        let handle = rig.tracker.mount("op1", OperationKind::SmsWait, None, code_shown());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rig.audio.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            rig.views.status("op1").unwrap().payload.delivered_code().as_deref(),
            Some("482913")
        );
        handle.unmount();
        handle.finished().await;
    }
}
