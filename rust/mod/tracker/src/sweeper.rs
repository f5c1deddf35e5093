use std::time::Duration;

use numbox_core::SweepSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::timer::ExpiryTimer;

/// Configuration for the deadline-record sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Pause between passes. The first pass runs immediately.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

impl From<&SweepSettings> for SweepConfig {
    fn from(settings: &SweepSettings) -> Self {
        Self {
            interval: settings.interval(),
        }
    }
}

/// Start the background sweep loop.
///
/// Deletes deadline records that expired longer ago than the timer's
/// retention window. Returns a CancellationToken that stops the loop.
pub fn start(timer: ExpiryTimer, config: SweepConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        let interval = config.interval;

        tokio::spawn(async move {
            info!("deadline sweeper started (interval={interval:?})");
            let mut first = true;
            loop {
                let pause = if first { Duration::ZERO } else { interval };
                first = false;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("deadline sweeper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(pause) => {
                        debug!("deadline sweep");
                        match timer.sweep() {
                            Ok(0) => {}
                            Ok(n) => info!("deadline sweeper: removed {n} records"),
                            Err(e) => error!("deadline sweeper error: {e}"),
                        }
                    }
                }
            }
        });
    }

    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::timer_key;
    use numbox_core::{Clock, ManualClock};
    use numbox_kv::{KVStore, MemoryStore};
    use std::sync::Arc;

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test(start_paused = true)]
    async fn sweeps_immediately_then_periodically() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let timer = ExpiryTimer::new(store.clone(), clock.clone());

        timer.start("stale", T0 - 4 * 3600 * 1000, Duration::from_secs(60));
        timer.start("live", clock.now_millis(), Duration::from_secs(900));

        let cancel = start(timer.clone(), SweepConfig::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.get(&timer_key("stale")).unwrap().is_none());
        assert!(store.get(&timer_key("live")).unwrap().is_some());

        // "live" is 2h past its deadline by the next pass.
        clock.advance(Duration::from_secs(3 * 3600));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(store.get(&timer_key("live")).unwrap().is_none());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let timer = ExpiryTimer::new(store.clone(), clock.clone());

        let cancel = start(timer.clone(), SweepConfig::from(&SweepSettings::default()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        tokio::task::yield_now().await;

        timer.start("old", T0 - 4 * 3600 * 1000, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(store.get(&timer_key("old")).unwrap().is_some());
    }
}
