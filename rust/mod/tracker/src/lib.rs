//! Operation tracker: countdown, status polling and delivery cue for
//! time-boxed server-side operations.
//!
//! - [`timer`] persists a deadline per operation and renders the countdown.
//! - [`poller`] fetches status on a fixed cadence and reconciles it.
//! - [`notifier`] plays the delivery chime, honouring the sound preference.
//! - [`tracker`] mounts all of the above per operation.

pub mod audio;
pub mod clock;
pub mod fetch;
pub mod model;
pub mod notifier;
pub mod poller;
pub mod prefs;
pub mod sink;
pub mod sweeper;
pub mod timer;
pub mod tracker;

pub use audio::{AudioBackend, AudioError, ContextState, TerminalBell, Tone, ToneContext, CHIME, FALLBACK_CLIP};
pub use clock::AnchoredClock;
pub use fetch::{FetchError, FnFetcher, HttpStatusFetcher, NoAuth, StaticToken, StatusFetcher, TokenSource};
pub use model::{DeadlineRecord, OperationStatus, Payload, Reconciliation, StatusReport, TrackedOperation};
pub use notifier::{Notifier, NotifyOutcome};
pub use numbox_core::OperationKind;
pub use poller::{begin_polling, ChangeCallback, PollConfig, PollHandle, PollOutcome, PollerPhase, StateChange};
pub use prefs::{NotificationPrefs, SOUND_PREF_KEY};
pub use sink::{StateSink, StatusView, SubscriptionId, TimerView, ViewStore, ViewUpdate, ALL_OPERATIONS};
pub use sweeper::SweepConfig;
pub use timer::{
    Countdown, CountdownEnd, ExpiryTimer, TimerReading, EXPIRED_TEXT, NOTIFIED_KEY_PREFIX, TIMER_KEY_PREFIX,
};
pub use tracker::{OperationTracker, TrackerEnd, TrackerHandle, TrackerOutcome};
