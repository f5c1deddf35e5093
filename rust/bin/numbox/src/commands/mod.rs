pub mod sound;
pub mod timers;
pub mod watch;

use std::sync::Arc;

use numbox_core::TrackerConfig;
use numbox_kv::{KVStore, RedbStore};

/// Open the state database named by the config.
pub fn open_store(config: &TrackerConfig) -> anyhow::Result<Arc<dyn KVStore>> {
    let path = config.resolve_db_path();
    let store = RedbStore::open(&path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    Ok(Arc::new(store))
}
