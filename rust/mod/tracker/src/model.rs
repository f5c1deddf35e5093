use std::fmt;
use std::time::Duration;

use numbox_kv::KVError;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Server-reported state of a tracked operation.
///
/// ```text
/// PENDING → PROCESSING → SUCCESS
///                      → FAILED
/// ```
///
/// Transitions only move forward; SUCCESS and FAILED are terminal.
/// `DELIVERED` is accepted on input as a synonym of SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Case-insensitive parse, accepting `DELIVERED` for SUCCESS.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SUCCESS" | "DELIVERED" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transition or polling can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Success | Self::Failed => 2,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_str(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown operation status: {raw}")))
    }
}

// ---------------------------------------------------------------------------
// Payload / StatusReport
// ---------------------------------------------------------------------------

/// Last-observed result fields (received code, assigned number, amount...).
///
/// Opaque to the tracker except for the delivered code; replaced wholesale
/// on every accepted poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }

    /// The delivered SMS code, if the payload carries a non-empty one.
    ///
    /// Numeric codes are accepted and rendered as decimal strings.
    pub fn delivered_code(&self) -> Option<String> {
        match self.0.get("code")? {
            serde_json::Value::String(s) => {
                let code = s.trim();
                (!code.is_empty()).then(|| code.to_string())
            }
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// One answer of the status-fetch collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: OperationStatus,
    #[serde(default)]
    pub payload: Payload,
}

impl StatusReport {
    pub fn new(status: OperationStatus, payload: serde_json::Value) -> Self {
        Self {
            status,
            payload: Payload(payload),
        }
    }

    pub fn pending() -> Self {
        Self::new(OperationStatus::Pending, serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// TrackedOperation: the unit being observed
// ---------------------------------------------------------------------------

/// Outcome of feeding one [`StatusReport`] into a [`TrackedOperation`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Status or payload differ from what was known before.
    pub changed: bool,
    /// Set exactly once per operation: the first time a delivered code shows up.
    pub newly_delivered: Option<String>,
}

/// A server-side, time-boxed operation as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOperation {
    pub operation_id: String,
    /// Operation start, milliseconds since the Unix epoch. Never mutated.
    pub created_at: i64,
    pub duration_budget: Duration,
    pub last_known_state: OperationStatus,
    pub payload: Payload,
    notified: bool,
}

impl TrackedOperation {
    pub fn new(operation_id: impl Into<String>, created_at: i64, duration_budget: Duration) -> Self {
        Self {
            operation_id: operation_id.into(),
            created_at,
            duration_budget,
            last_known_state: OperationStatus::Pending,
            payload: Payload::default(),
            notified: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.last_known_state.is_terminal()
    }

    /// Seed the delivery latch, e.g. from a marker persisted by an earlier mount.
    pub fn with_notified(mut self, notified: bool) -> Self {
        self.notified = notified;
        self
    }

    /// Whether the delivery cue has already been claimed for this operation.
    pub fn notified(&self) -> bool {
        self.notified
    }

    /// Compare a fresh report against what is known and update on change.
    ///
    /// A terminal operation ignores every further report. A status that
    /// would move backwards is held at the current one; the payload is still
    /// taken. Status and payload are written together or not at all.
    pub fn reconcile(&mut self, report: StatusReport) -> Reconciliation {
        if self.is_terminal() {
            return Reconciliation::default();
        }

        let status = if report.status.rank() < self.last_known_state.rank() {
            debug!(
                operation_id = %self.operation_id,
                current = %self.last_known_state,
                reported = %report.status,
                "ignoring backward status transition"
            );
            self.last_known_state
        } else {
            report.status
        };

        if status == self.last_known_state && report.payload == self.payload {
            return Reconciliation::default();
        }

        self.last_known_state = status;
        self.payload = report.payload;

        let newly_delivered = if self.notified {
            None
        } else {
            self.payload.delivered_code()
        };
        if newly_delivered.is_some() {
            self.notified = true;
        }

        Reconciliation {
            changed: true,
            newly_delivered,
        }
    }
}

// ---------------------------------------------------------------------------
// DeadlineRecord: persisted under `timer_<operationId>`
// ---------------------------------------------------------------------------

/// The persisted `(createdAt, durationBudget)` pair behind a countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineRecord {
    pub created_at: i64,
    pub duration_ms: i64,
}

impl DeadlineRecord {
    pub fn new(created_at: i64, budget: Duration) -> Self {
        Self {
            created_at,
            duration_ms: i64::try_from(budget.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn deadline_millis(&self) -> i64 {
        self.created_at.saturating_add(self.duration_ms)
    }

    /// Milliseconds left at `now`; negative once expired.
    pub fn remaining_ms(&self, now: i64) -> i64 {
        self.deadline_millis().saturating_sub(now)
    }

    /// Parse a stored record. Anything unreadable counts as absent.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record: DeadlineRecord = serde_json::from_slice(bytes).ok()?;
        (record.duration_ms >= 0).then_some(record)
    }

    pub fn encode(&self) -> Result<Vec<u8>, KVError> {
        serde_json::to_vec(self).map_err(|e| KVError::Serialization(e.to_string()))
    }
}
