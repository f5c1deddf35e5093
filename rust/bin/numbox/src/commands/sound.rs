//! Delivery sound preference commands.

use anyhow::Result;
use numbox_core::TrackerConfig;
use numbox_tracker::NotificationPrefs;

use super::open_store;

pub fn set(config: &TrackerConfig, enabled: bool) -> Result<()> {
    let prefs = NotificationPrefs::load(open_store(config)?);
    prefs.set_enabled(enabled);
    print_state(enabled);
    Ok(())
}

pub fn toggle(config: &TrackerConfig) -> Result<()> {
    let prefs = NotificationPrefs::load(open_store(config)?);
    print_state(prefs.toggle());
    Ok(())
}

pub fn status(config: &TrackerConfig) -> Result<()> {
    let prefs = NotificationPrefs::load(open_store(config)?);
    print_state(prefs.is_enabled());
    Ok(())
}

fn print_state(enabled: bool) {
    println!("Delivery sound: {}", if enabled { "on" } else { "off" });
}
