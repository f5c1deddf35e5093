use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// Class of a time-boxed server-side operation.
///
/// The kind fixes the duration budget, the poll cadence, the hard timeout and
/// whether a delivered result rings the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Waiting for an SMS on a rented number.
    SmsWait,
    /// Waiting for the provider to assign a number.
    NumberAssignment,
    /// Waiting for a mobile-money payment to settle.
    PaymentConfirmation,
    /// Waiting for the SMS right after a number purchase.
    PurchaseSms,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        Self::SmsWait,
        Self::NumberAssignment,
        Self::PaymentConfirmation,
        Self::PurchaseSms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmsWait => "sms_wait",
            Self::NumberAssignment => "number_assignment",
            Self::PaymentConfirmation => "payment_confirmation",
            Self::PurchaseSms => "purchase_sms",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.replace('-', "_").as_str() {
            "sms_wait" => Some(Self::SmsWait),
            "number_assignment" => Some(Self::NumberAssignment),
            "payment_confirmation" => Some(Self::PaymentConfirmation),
            "purchase_sms" => Some(Self::PurchaseSms),
            _ => None,
        }
    }

    /// Built-in class settings, before any config override.
    pub fn defaults(&self) -> ClassConfig {
        match self {
            Self::SmsWait => ClassConfig {
                budget: Duration::from_secs(15 * 60),
                poll_interval: Duration::from_secs(10),
                hard_timeout: Duration::from_secs(15 * 60),
                status_path: "/api/sms/{id}/status".to_string(),
                notify: true,
            },
            Self::NumberAssignment => ClassConfig {
                budget: Duration::from_secs(5 * 60),
                poll_interval: Duration::from_secs(10),
                hard_timeout: Duration::from_secs(5 * 60),
                status_path: "/api/numbers/{id}/status".to_string(),
                notify: false,
            },
            Self::PaymentConfirmation => ClassConfig {
                budget: Duration::from_secs(60),
                poll_interval: Duration::from_secs(3),
                hard_timeout: Duration::from_secs(60),
                status_path: "/api/payments/{id}/status".to_string(),
                notify: false,
            },
            Self::PurchaseSms => ClassConfig {
                budget: Duration::from_secs(15 * 60),
                poll_interval: Duration::from_secs(30),
                hard_timeout: Duration::from_secs(15 * 60),
                status_path: "/api/numbers/{id}/sms".to_string(),
                notify: true,
            },
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ClassConfig: resolved per-kind settings
// ---------------------------------------------------------------------------

/// Fully resolved settings for one [`OperationKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassConfig {
    /// Time the operation is allowed to take, measured from its creation.
    pub budget: Duration,
    /// Delay between two status fetches.
    pub poll_interval: Duration,
    /// Maximum time the poller runs, regardless of server status.
    pub hard_timeout: Duration,
    /// Status endpoint path; `{id}` is replaced by the operation id.
    pub status_path: String,
    /// Whether a newly delivered code triggers the audible cue.
    pub notify: bool,
}

/// Optional per-kind overrides as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
}

impl ClassOverride {
    fn apply(&self, mut base: ClassConfig) -> ClassConfig {
        if let Some(secs) = self.budget_secs {
            base.budget = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            base.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.hard_timeout_secs {
            base.hard_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = &self.status_path {
            base.status_path = path.clone();
        }
        if let Some(notify) = self.notify {
            base.notify = notify;
        }
        base
    }
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

/// Remote API connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the remote service (e.g. "https://api.example.com").
    pub base_url: String,

    /// Bearer token sent with every status request. Empty = anonymous.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// Local persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the state database. Defaults to `~/.numbox`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Explicit redb file path. Defaults to `{data_dir}/state.redb`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// Garbage collection of stale deadline records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Seconds between two sweeps.
    pub interval_secs: u64,
    /// A record expired for longer than this many seconds is deleted.
    pub retention_secs: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retention_secs: 3600,
        }
    }
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Tracker configuration, read from `~/.numbox/config.toml`.
///
/// ```toml
/// [api]
/// base_url = "https://api.example.com"
///
/// [sweep]
/// interval_secs = 3600
///
/// [sms_wait]
/// poll_interval_ms = 5000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub sweep: SweepSettings,

    #[serde(skip_serializing_if = "is_default_override")]
    pub sms_wait: ClassOverride,
    #[serde(skip_serializing_if = "is_default_override")]
    pub number_assignment: ClassOverride,
    #[serde(skip_serializing_if = "is_default_override")]
    pub payment_confirmation: ClassOverride,
    #[serde(skip_serializing_if = "is_default_override")]
    pub purchase_sms: ClassOverride,
}

fn is_default_override(o: &ClassOverride) -> bool {
    *o == ClassOverride::default()
}

impl TrackerConfig {
    /// Default config file path: ~/.numbox/config.toml.
    pub fn default_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    /// Load config from disk, or return defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: TrackerConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io_err)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `--key=value` overrides on top of the loaded file.
    ///
    /// Supported flags:
    /// - `--api=URL`
    /// - `--token=TOKEN`
    /// - `--data-dir=PATH`
    /// - `--db=PATH`
    pub fn apply_args(&mut self, args: &[String]) {
        for arg in args {
            if let Some(val) = arg.strip_prefix("--api=") {
                self.api.base_url = val.to_string();
            } else if let Some(val) = arg.strip_prefix("--token=") {
                self.api.token = val.to_string();
            } else if let Some(val) = arg.strip_prefix("--data-dir=") {
                self.store.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--db=") {
                self.store.db_path = Some(PathBuf::from(val));
            }
        }
    }

    /// Reject settings that would make a cadence spin or a budget vanish.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in OperationKind::ALL {
            let class = self.class(kind);
            if class.poll_interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{kind}: poll interval is zero")));
            }
            if class.budget.is_zero() {
                return Err(ConfigError::Invalid(format!("{kind}: budget is zero")));
            }
            if class.hard_timeout.is_zero() {
                return Err(ConfigError::Invalid(format!("{kind}: hard timeout is zero")));
            }
            if !class.status_path.contains("{id}") {
                return Err(ConfigError::Invalid(format!(
                    "{kind}: status path {:?} has no {{id}} placeholder",
                    class.status_path
                )));
            }
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep interval is zero".into()));
        }
        Ok(())
    }

    /// Resolved settings for one operation kind.
    pub fn class(&self, kind: OperationKind) -> ClassConfig {
        let overrides = match kind {
            OperationKind::SmsWait => &self.sms_wait,
            OperationKind::NumberAssignment => &self.number_assignment,
            OperationKind::PaymentConfirmation => &self.payment_confirmation,
            OperationKind::PurchaseSms => &self.purchase_sms,
        };
        overrides.apply(kind.defaults())
    }

    /// Resolve the state database path, falling back to `{data_dir}/state.redb`.
    pub fn resolve_db_path(&self) -> PathBuf {
        self.store.db_path.clone().unwrap_or_else(|| {
            self.store
                .data_dir
                .clone()
                .unwrap_or_else(dirs_path)
                .join("state.redb")
        })
    }
}

/// Return the numbox directory (~/.numbox).
fn dirs_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".numbox")
}
