pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApiConfig, ClassConfig, ClassOverride, OperationKind, StoreConfig, SweepSettings, TrackerConfig};
pub use error::ConfigError;
