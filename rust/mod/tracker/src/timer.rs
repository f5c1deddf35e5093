use std::sync::Arc;
use std::time::Duration;

use numbox_core::Clock;
use numbox_kv::{KVError, KVStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::DeadlineRecord;
use crate::sink::{StateSink, TimerView, ViewUpdate};

/// Key prefix of persisted deadline records.
pub const TIMER_KEY_PREFIX: &str = "timer_";

/// Key prefix of the per-operation "delivery cue played" markers.
pub const NOTIFIED_KEY_PREFIX: &str = "notified_";

/// Text shown once a countdown has run out.
pub const EXPIRED_TEXT: &str = "Expiré";

/// Default retention of expired records before the sweep deletes them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

const TICK: Duration = Duration::from_secs(1);

pub fn timer_key(operation_id: &str) -> String {
    format!("{TIMER_KEY_PREFIX}{operation_id}")
}

pub fn notified_key(operation_id: &str) -> String {
    format!("{NOTIFIED_KEY_PREFIX}{operation_id}")
}

/// Render remaining milliseconds as `m:ss`, rounding down to whole seconds.
pub fn format_remaining(remaining_ms: i64) -> String {
    let secs = remaining_ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// One countdown observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerReading {
    pub remaining_ms: i64,
    pub text: String,
    pub is_expired: bool,
}

impl TimerReading {
    pub fn view(&self) -> TimerView {
        TimerView {
            remaining_text: self.text.clone(),
            is_expired: self.is_expired,
        }
    }
}

// ---------------------------------------------------------------------------
// ExpiryTimer: deadline bookkeeping over the KV store
// ---------------------------------------------------------------------------

/// Persists per-operation deadlines so a countdown survives reloads.
///
/// Store failures never escape: an unreadable record counts as absent, an
/// unwritable one lives only in the [`Countdown`] for this session.
#[derive(Clone)]
pub struct ExpiryTimer {
    store: Arc<dyn KVStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl ExpiryTimer {
    pub fn new(store: Arc<dyn KVStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Establish or restore the deadline of an operation.
    ///
    /// An existing well-formed record wins over the arguments, so restarting
    /// a countdown never resets the clock.
    pub fn start(&self, operation_id: &str, created_at: i64, budget: Duration) -> Countdown {
        let record = match self.load(operation_id) {
            Some(existing) => {
                debug!(operation_id, deadline = existing.deadline_millis(), "restored deadline");
                existing
            }
            None => {
                let fresh = DeadlineRecord::new(created_at, budget);
                if let Err(e) = self.save(operation_id, &fresh) {
                    warn!(operation_id, "deadline not persisted, keeping it in memory: {e}");
                }
                fresh
            }
        };

        Countdown {
            operation_id: operation_id.to_string(),
            record,
            timer: self.clone(),
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// Read a deadline record. Missing, malformed and unreadable all yield `None`.
    pub fn load(&self, operation_id: &str) -> Option<DeadlineRecord> {
        match self.store.get(&timer_key(operation_id)) {
            Ok(Some(bytes)) => {
                let record = DeadlineRecord::decode(&bytes);
                if record.is_none() {
                    warn!(operation_id, "ignoring malformed deadline record");
                }
                record
            }
            Ok(None) => None,
            Err(e) => {
                warn!(operation_id, "deadline store unreadable: {e}");
                None
            }
        }
    }

    fn save(&self, operation_id: &str, record: &DeadlineRecord) -> Result<(), KVError> {
        self.store.set(&timer_key(operation_id), &record.encode()?)
    }

    /// Delete the deadline record unconditionally.
    pub fn stop(&self, operation_id: &str) {
        if let Err(e) = self.store.remove(&timer_key(operation_id)) {
            warn!(operation_id, "failed to delete deadline record: {e}");
        }
    }

    /// All well-formed deadline records, keyed by operation id.
    pub fn records(&self) -> Result<Vec<(String, DeadlineRecord)>, KVError> {
        Ok(self
            .store
            .scan(TIMER_KEY_PREFIX)?
            .into_iter()
            .filter_map(|(key, bytes)| {
                let id = key.strip_prefix(TIMER_KEY_PREFIX)?.to_string();
                DeadlineRecord::decode(&bytes).map(|r| (id, r))
            })
            .collect())
    }

    /// Remember that the delivery cue for an operation has played.
    ///
    /// The marker holds the time it was written and outlives the deadline
    /// record, so a remount after resolution stays silent too.
    pub fn mark_notified(&self, operation_id: &str) {
        let now = self.clock.now_millis().to_string();
        if let Err(e) = self.store.set(&notified_key(operation_id), now.as_bytes()) {
            warn!(operation_id, "delivery marker not persisted: {e}");
        }
    }

    pub fn was_notified(&self, operation_id: &str) -> bool {
        match self.store.get(&notified_key(operation_id)) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(operation_id, "delivery marker unreadable: {e}");
                false
            }
        }
    }

    /// Delete records expired for longer than the retention window, records
    /// that cannot be parsed, and delivery markers older than the window
    /// whose countdown is gone. Returns how many keys were deleted.
    ///
    /// A key that fails to delete is logged and left for the next pass.
    pub fn sweep(&self) -> Result<usize, KVError> {
        let now = self.clock.now_millis();
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let mut deleted = 0;

        for (key, bytes) in self.store.scan(TIMER_KEY_PREFIX)? {
            let stale = match DeadlineRecord::decode(&bytes) {
                Some(record) => record.remaining_ms(now) < -retention_ms,
                None => true,
            };
            if stale && self.remove_stale(&key) {
                deleted += 1;
            }
        }

        for (key, bytes) in self.store.scan(NOTIFIED_KEY_PREFIX)? {
            let id = key.strip_prefix(NOTIFIED_KEY_PREFIX).unwrap_or(&key);
            let marked_at = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|raw| raw.trim().parse::<i64>().ok());
            let stale = match marked_at {
                Some(at) => now.saturating_sub(at) > retention_ms && self.load(id).is_none(),
                None => true,
            };
            if stale && self.remove_stale(&key) {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!("deadline sweep removed {deleted} stale records");
        }
        Ok(deleted)
    }

    fn remove_stale(&self, key: &str) -> bool {
        match self.store.remove(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, "sweep could not delete stale key: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Countdown: live view of one deadline
// ---------------------------------------------------------------------------

/// How a countdown cadence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEnd {
    Expired,
    Stopped,
}

/// The per-operation countdown returned by [`ExpiryTimer::start`].
pub struct Countdown {
    operation_id: String,
    record: DeadlineRecord,
    timer: ExpiryTimer,
    cancel: CancellationToken,
    finished: bool,
}

impl Countdown {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// The deadline this countdown runs against.
    pub fn record(&self) -> DeadlineRecord {
        self.record
    }

    pub fn remaining_ms(&self) -> i64 {
        self.record.remaining_ms(self.timer.clock.now_millis())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Token that stops [`Countdown::run`]. Cancelling it is idempotent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace the cancellation token, e.g. with a child of a parent scope.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Compute the current reading.
    ///
    /// Expiry is reported exactly once: that tick deletes the persisted
    /// record and every later call returns `None`.
    pub fn tick(&mut self) -> Option<TimerReading> {
        if self.finished {
            return None;
        }

        let record = self.timer.load(&self.operation_id).unwrap_or(self.record);
        let remaining_ms = record.remaining_ms(self.timer.clock.now_millis());

        if remaining_ms <= 0 {
            self.finished = true;
            self.timer.stop(&self.operation_id);
            info!(operation_id = %self.operation_id, "countdown expired");
            return Some(TimerReading {
                remaining_ms,
                text: EXPIRED_TEXT.to_string(),
                is_expired: true,
            });
        }

        Some(TimerReading {
            remaining_ms,
            text: format_remaining(remaining_ms),
            is_expired: false,
        })
    }

    /// Stop the cadence and delete the persisted record.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.finished = true;
        self.timer.stop(&self.operation_id);
    }

    /// Tick every second, publishing each reading, until expiry or cancellation.
    pub async fn run(mut self, sink: Arc<dyn StateSink>) -> CountdownEnd {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(operation_id = %self.operation_id, "countdown stopped");
                    return CountdownEnd::Stopped;
                }
                _ = ticker.tick() => {
                    let Some(reading) = self.tick() else {
                        return CountdownEnd::Stopped;
                    };
                    sink.publish(&self.operation_id, ViewUpdate::Timer(reading.view()));
                    if reading.is_expired {
                        return CountdownEnd::Expired;
                    }
                }
            }
        }
    }
}
