use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use numbox_kv::KVStore;
use tracing::{info, warn};

/// Store key of the delivery-sound toggle.
pub const SOUND_PREF_KEY: &str = "sms_sound_enabled";

/// User preference for the delivery sound.
///
/// Read once at construction; [`set_enabled`](Self::set_enabled) updates the
/// in-memory value and writes through. A failed write keeps the new value for
/// the session.
pub struct NotificationPrefs {
    store: Arc<dyn KVStore>,
    enabled: AtomicBool,
}

impl NotificationPrefs {
    pub fn load(store: Arc<dyn KVStore>) -> Self {
        let enabled = match store.get(SOUND_PREF_KEY) {
            Ok(Some(raw)) => parse_flag(&raw).unwrap_or_else(|| {
                warn!("unrecognised {SOUND_PREF_KEY} value, defaulting to enabled");
                true
            }),
            Ok(None) => true,
            Err(e) => {
                warn!("failed to read {SOUND_PREF_KEY}: {e}");
                true
            }
        };
        Self {
            store,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        let raw: &[u8] = if enabled { b"true" } else { b"false" };
        match self.store.set(SOUND_PREF_KEY, raw) {
            Ok(()) => info!(enabled, "delivery sound preference saved"),
            Err(e) => warn!("failed to persist {SOUND_PREF_KEY}: {e}"),
        }
    }

    /// Flip the preference and return the new value.
    pub fn toggle(&self) -> bool {
        let next = !self.is_enabled();
        self.set_enabled(next);
        next
    }
}

fn parse_flag(raw: &[u8]) -> Option<bool> {
    match std::str::from_utf8(raw).ok()?.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
