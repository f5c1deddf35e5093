use crate::error::KVError;

/// KVStore is the small durable key-value store the tracker persists into.
///
/// Keys are flat strings with a purpose prefix: `timer_<operationId>` for
/// deadline records, `sms_sound_enabled` for the notification preference.
/// Calls are synchronous; a failing store is reported through `KVError` and
/// callers decide whether to fall back to in-memory state.
pub trait KVStore: Send + Sync {
    /// Get the value for a key. Returns None if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError>;

    /// Set a key-value pair, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), KVError>;

    /// Scan all keys matching a prefix. Returns sorted (key, value) pairs.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError>;
}
