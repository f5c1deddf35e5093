//! `numbox watch`: mount a tracker and render its views on the terminal.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use numbox_core::{OperationKind, SystemClock, TrackerConfig};
use numbox_tracker::{
    sweeper, HttpStatusFetcher, NoAuth, NotificationPrefs, Notifier, OperationTracker, StaticToken,
    SweepConfig, TerminalBell, TokenSource, TrackerEnd, ViewStore, ViewUpdate, ALL_OPERATIONS,
};
use tracing::info;

use super::open_store;

pub async fn run(
    config: &TrackerConfig,
    kind: OperationKind,
    id: &str,
    created_at: Option<i64>,
) -> Result<()> {
    if config.api.base_url.is_empty() {
        anyhow::bail!("No API base URL. Pass --api or set api.base_url in the config file.");
    }

    let store = open_store(config)?;
    let prefs = Arc::new(NotificationPrefs::load(Arc::clone(&store)));
    let notifier = Arc::new(Notifier::new(Arc::new(TerminalBell::new()), prefs));
    let views = Arc::new(ViewStore::new());

    views.subscribe(ALL_OPERATIONS, |id, update| {
        let mut out = std::io::stdout().lock();
        match update {
            ViewUpdate::Timer(t) => {
                let _ = write!(out, "\r{id}  {:>8}", t.remaining_text);
                if t.is_expired {
                    let _ = writeln!(out);
                }
            }
            ViewUpdate::Status(s) => {
                let _ = writeln!(out, "\r{id}  {}  {}", s.status, s.payload.0);
            }
        }
        let _ = out.flush();
    });

    let tracker = OperationTracker::new(
        Arc::clone(&store),
        Arc::new(SystemClock),
        notifier,
        views.clone(),
        config.clone(),
    );
    let sweep = sweeper::start(tracker.timer().clone(), SweepConfig::from(&config.sweep));

    let token_source: Arc<dyn TokenSource> = if config.api.token.is_empty() {
        Arc::new(NoAuth)
    } else {
        Arc::new(StaticToken::new(config.api.token.clone()))
    };
    let class = config.class(kind);
    let fetcher = HttpStatusFetcher::for_class(&config.api.base_url, &class, token_source);
    info!(operation_id = id, url = %fetcher.status_url(id), "watching {kind}");

    let handle = tracker.mount(id, kind, created_at, Arc::new(fetcher));

    let unmount = handle.cancel_token();
    let finished = handle.finished();
    tokio::pin!(finished);

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(operation_id = id, "interrupted, unmounting");
            unmount.cancel();
            finished.await
        }
        outcome = &mut finished => outcome,
    };
    sweep.cancel();

    println!();
    let op = &outcome.operation;
    match outcome.end {
        TrackerEnd::Resolved => match op.payload.delivered_code() {
            Some(code) => println!("{} {}: code {}", op.operation_id, op.last_known_state, code),
            None => println!("{} {}", op.operation_id, op.last_known_state),
        },
        TrackerEnd::Expired => println!("{} expired ({})", op.operation_id, op.last_known_state),
        TrackerEnd::TimedOut => println!("{} timed out ({})", op.operation_id, op.last_known_state),
        TrackerEnd::Unmounted => println!("{} detached; run watch again to resume", op.operation_id),
    }
    Ok(())
}
