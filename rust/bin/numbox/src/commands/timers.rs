//! Persisted countdown commands.

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use numbox_core::{SystemClock, TrackerConfig};
use numbox_tracker::ExpiryTimer;
use numbox_tracker::timer::format_remaining;

use super::open_store;

fn expiry_timer(config: &TrackerConfig) -> Result<ExpiryTimer> {
    Ok(ExpiryTimer::new(open_store(config)?, Arc::new(SystemClock))
        .with_retention(config.sweep.retention()))
}

/// Print every persisted countdown with its remaining time.
pub fn list(config: &TrackerConfig) -> Result<()> {
    let timer = expiry_timer(config)?;
    let records = timer.records()?;
    if records.is_empty() {
        println!("No countdowns.");
        return Ok(());
    }

    let now = Utc::now().timestamp_millis();
    println!("{:<32} {:<22} {:>10}", "OPERATION", "STARTED", "REMAINING");
    for (id, record) in records {
        let started = Utc
            .timestamp_millis_opt(record.created_at)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.created_at.to_string());
        let remaining = record.remaining_ms(now);
        let left = if remaining > 0 {
            format_remaining(remaining)
        } else {
            numbox_tracker::EXPIRED_TEXT.to_string()
        };
        println!("{:<32} {:<22} {:>10}", id, started, left);
    }
    Ok(())
}

pub fn sweep(config: &TrackerConfig) -> Result<()> {
    let removed = expiry_timer(config)?.sweep()?;
    println!("Removed {removed} stale countdown(s).");
    Ok(())
}

pub fn stop(config: &TrackerConfig, id: &str) -> Result<()> {
    let timer = expiry_timer(config)?;
    if timer.load(id).is_none() {
        anyhow::bail!("No countdown for operation \"{}\".", id);
    }
    timer.stop(id);
    println!("Stopped countdown for {id}.");
    Ok(())
}
