use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::{OperationStatus, Payload};

/// Countdown view: `(remainingTimeText, isExpired)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerView {
    pub remaining_text: String,
    pub is_expired: bool,
}

/// Polled-state view: `(lastKnownState, payload, changed)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub status: OperationStatus,
    pub payload: Payload,
    pub changed: bool,
}

/// One update pushed from the tracker core to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Timer(TimerView),
    Status(StatusView),
}

/// Where the tracker core publishes what the UI should render.
///
/// Called from the timer and poll tasks; implementations must not block.
pub trait StateSink: Send + Sync {
    fn publish(&self, operation_id: &str, update: ViewUpdate);
}

/// Callback type for view change notifications.
pub type ViewHandler = Arc<dyn Fn(&str, &ViewUpdate) + Send + Sync>;

/// Handle returned by [`ViewStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Pattern that matches every operation.
pub const ALL_OPERATIONS: &str = "#";

#[derive(Clone)]
struct HandlerEntry {
    id: SubscriptionId,
    pattern: String,
    handler: ViewHandler,
}

#[derive(Debug, Clone, Default)]
struct Views {
    timer: Option<TimerView>,
    status: Option<StatusView>,
}

/// In-memory [`StateSink`] holding the latest views per operation.
///
/// - `publish` stores the update and notifies matching subscribers.
/// - `timer(id)` / `status(id)` read the latest view.
/// - `subscribe(pattern, handler)` registers a handler for one operation id,
///   or for all of them with [`ALL_OPERATIONS`].
pub struct ViewStore {
    views: RwLock<BTreeMap<String, Views>>,
    handlers: RwLock<Vec<HandlerEntry>>,
    next_id: AtomicU64,
}

impl ViewStore {
    pub fn new() -> Self {
        Self {
            views: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Latest countdown view for an operation.
    pub fn timer(&self, operation_id: &str) -> Option<TimerView> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.get(operation_id).and_then(|v| v.timer.clone())
    }

    /// Latest polled-state view for an operation.
    pub fn status(&self, operation_id: &str) -> Option<StatusView> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.get(operation_id).and_then(|v| v.status.clone())
    }

    /// Operation ids with at least one view, in order.
    pub fn operations(&self) -> Vec<String> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.keys().cloned().collect()
    }

    /// Drop every view of an operation. Does NOT notify subscribers.
    pub fn forget(&self, operation_id: &str) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        views.remove(operation_id);
    }

    /// Subscribe to updates for `pattern` (an operation id or `#`).
    ///
    /// Handlers run synchronously on the publishing task.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &ViewUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(HandlerEntry {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.retain(|entry| entry.id != id);
    }
}

impl Default for ViewStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSink for ViewStore {
    fn publish(&self, operation_id: &str, update: ViewUpdate) {
        {
            let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
            let entry = views.entry(operation_id.to_string()).or_default();
            match &update {
                ViewUpdate::Timer(view) => entry.timer = Some(view.clone()),
                ViewUpdate::Status(view) => entry.status = Some(view.clone()),
            }
        }

        // Snapshot handlers so a handler may (un)subscribe without deadlock.
        let matching: Vec<ViewHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .iter()
                .filter(|e| e.pattern == ALL_OPERATIONS || e.pattern == operation_id)
                .map(|e| Arc::clone(&e.handler))
                .collect()
        };
        for handler in matching {
            handler(operation_id, &update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn timer_view(text: &str, expired: bool) -> ViewUpdate {
        ViewUpdate::Timer(TimerView {
            remaining_text: text.to_string(),
            is_expired: expired,
        })
    }

    #[test]
    fn keeps_latest_views_per_operation() {
        let store = ViewStore::new();
        store.publish("op1", timer_view("14:59", false));
        store.publish("op1", timer_view("14:58", false));
        store.publish(
            "op1",
            ViewUpdate::Status(StatusView {
                status: OperationStatus::Processing,
                payload: Payload::default(),
                changed: true,
            }),
        );

        assert_eq!(store.timer("op1").unwrap().remaining_text, "14:58");
        assert_eq!(store.status("op1").unwrap().status, OperationStatus::Processing);
        assert!(store.timer("op2").is_none());
        assert_eq!(store.operations(), vec!["op1".to_string()]);

        store.forget("op1");
        assert!(store.timer("op1").is_none());
        assert!(store.operations().is_empty());
    }

    #[test]
    fn exact_and_wildcard_subscribers() {
        let store = ViewStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        store.subscribe("op1", move |id, _| s.lock().unwrap().push(format!("exact:{id}")));
        let s = Arc::clone(&seen);
        store.subscribe(ALL_OPERATIONS, move |id, _| s.lock().unwrap().push(format!("all:{id}")));

        store.publish("op1", timer_view("0:10", false));
        store.publish("op2", timer_view("0:09", false));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["exact:op1", "all:op1", "all:op2"]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = ViewStore::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&count);
        let id = store.subscribe(ALL_OPERATIONS, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.publish("op1", timer_view("0:01", false));
        store.unsubscribe(id);
        store.publish("op1", timer_view("Expiré", true));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(store.timer("op1").unwrap().is_expired);
    }
}
