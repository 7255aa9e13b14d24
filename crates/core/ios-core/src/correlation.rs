//! Process-wide pipeline correlation state.
//!
//! Handlers on different topics run concurrently and stitch the pipeline
//! together through this store: the trigger handler records when a part
//! entered the line, later stages read that instant back to compute their own
//! and end-to-end latency. Keys are a closed enumeration so a misspelt key is
//! a compile error rather than a silent miss.
//!
//! Each key holds exactly one [`CorrelationRecord`]; writes replace the whole
//! record (last write wins), so a reader never observes a half-updated value.
//! Absence is normal and means "correlation unknown".

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Well-known correlation keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CorrelationKey {
    // trigger
    /// When the grating sensor fired
    LastGratingTriggerTime,
    /// Raw grating trigger message (the travel direction)
    TriggerMessage,
    /// When the vision request was published
    LastVisionRequestTime,

    // camera inspection
    /// "Valid" or "Invalid"
    LastDetectionResult,
    /// When the camera result arrived
    LastDetectionTime,
    /// Full camera result payload
    LastCameraResult,
    /// Trigger to camera-result latency
    LastProcessingTime,
    /// Reason recorded for an invalid detection
    LastErrorMessage,

    // height measurement
    /// Raw height result
    LastHeightResult,
    /// When the height result arrived
    LastHeightDetectionTime,
    /// Trigger to height-result latency
    LastHeightProcessingTime,

    // motion
    /// When the motion command was published
    LastMotionRequestTime,
    /// When motion reported completion
    LastMotionCompleteTime,
    /// Raw motion completion message
    LastMotionCompleteMessage,
    /// Motion request to completion latency
    LastMotionExecutionTime,

    // coding
    /// When the coding command was published
    LastCoderRequestTime,
    /// When coding reported completion
    LastCoderCompleteTime,
    /// Full coder result payload
    LastCoderResult,
    /// Coder request to completion latency
    LastCoderExecutionTime,
    /// Successful coding operations
    CoderSuccessCount,
    /// Failed coding operations
    CoderFailureCount,
    /// Last coding failure message
    LastCoderError,
    /// Trigger to coding-complete latency
    LastTotalProcessTime,
    /// When the order was last updated
    LastOrderUpdateTime,
    /// Id of the last coded order
    LastOrderId,

    // coder gateway
    /// Last frame read from a coder device
    LastCoderData,
    /// When that frame arrived
    LastCoderDataTime,
    /// Connection id that sent it
    LastCoderClientId,
    /// Remote endpoint that sent it
    LastCoderClientEndpoint,
    /// Gateway status text
    CoderStatus,
    /// When the status last changed
    CoderStatusTime,
    /// Whether the gateway is listening
    CoderIsRunning,
    /// When the last service command arrived
    LastCoderServiceRequestTime,
    /// The last service command
    LastCoderServiceCommand,
    /// When configuration was last applied
    LastCoderConfigUpdateTime,
    /// The last applied configuration
    LastCoderConfig,
}

impl CorrelationKey {
    /// Key name as used in logs and snapshots
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastGratingTriggerTime => "LastGratingTriggerTime",
            Self::TriggerMessage => "TriggerMessage",
            Self::LastVisionRequestTime => "LastVisionRequestTime",
            Self::LastDetectionResult => "LastDetectionResult",
            Self::LastDetectionTime => "LastDetectionTime",
            Self::LastCameraResult => "LastCameraResult",
            Self::LastProcessingTime => "LastProcessingTime",
            Self::LastErrorMessage => "LastErrorMessage",
            Self::LastHeightResult => "LastHeightResult",
            Self::LastHeightDetectionTime => "LastHeightDetectionTime",
            Self::LastHeightProcessingTime => "LastHeightProcessingTime",
            Self::LastMotionRequestTime => "LastMotionRequestTime",
            Self::LastMotionCompleteTime => "LastMotionCompleteTime",
            Self::LastMotionCompleteMessage => "LastMotionCompleteMessage",
            Self::LastMotionExecutionTime => "LastMotionExecutionTime",
            Self::LastCoderRequestTime => "LastCoderRequestTime",
            Self::LastCoderCompleteTime => "LastCoderCompleteTime",
            Self::LastCoderResult => "LastCoderResult",
            Self::LastCoderExecutionTime => "LastCoderExecutionTime",
            Self::CoderSuccessCount => "CoderSuccessCount",
            Self::CoderFailureCount => "CoderFailureCount",
            Self::LastCoderError => "LastCoderError",
            Self::LastTotalProcessTime => "LastTotalProcessTime",
            Self::LastOrderUpdateTime => "LastOrderUpdateTime",
            Self::LastOrderId => "LastOrderId",
            Self::LastCoderData => "LastCoderData",
            Self::LastCoderDataTime => "LastCoderDataTime",
            Self::LastCoderClientId => "LastCoderClientId",
            Self::LastCoderClientEndpoint => "LastCoderClientEndpoint",
            Self::CoderStatus => "CoderStatus",
            Self::CoderStatusTime => "CoderStatusTime",
            Self::CoderIsRunning => "CoderIsRunning",
            Self::LastCoderServiceRequestTime => "LastCoderServiceRequestTime",
            Self::LastCoderServiceCommand => "LastCoderServiceCommand",
            Self::LastCoderConfigUpdateTime => "LastCoderConfigUpdateTime",
            Self::LastCoderConfig => "LastCoderConfig",
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held in the store
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationValue {
    /// A point in time
    Instant(DateTime<Utc>),
    /// A measured latency
    Elapsed(TimeDelta),
    /// Free text
    Text(String),
    /// A boolean flag
    Flag(bool),
    /// A monotonically increasing counter
    Count(u64),
    /// A structured payload
    Json(serde_json::Value),
}

impl CorrelationValue {
    /// Compact rendering for logs and snapshots
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Instant(at) => at.to_rfc3339(),
            Self::Elapsed(delta) => format!("{}ms", delta.num_milliseconds()),
            Self::Text(text) => text.clone(),
            Self::Flag(flag) => flag.to_string(),
            Self::Count(count) => count.to_string(),
            Self::Json(value) => value.to_string(),
        }
    }
}

impl From<DateTime<Utc>> for CorrelationValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Instant(value)
    }
}

impl From<TimeDelta> for CorrelationValue {
    fn from(value: TimeDelta) -> Self {
        Self::Elapsed(value)
    }
}

impl From<String> for CorrelationValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for CorrelationValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for CorrelationValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<u64> for CorrelationValue {
    fn from(value: u64) -> Self {
        Self::Count(value)
    }
}

impl From<serde_json::Value> for CorrelationValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// One stored entry
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRecord {
    /// Key
    pub key: CorrelationKey,
    /// Value
    pub value: CorrelationValue,
    /// When the value was written
    pub written_at: DateTime<Utc>,
}

/// Concurrent key/value store shared by a stage's handlers.
///
/// Cloning is cheap and every clone sees the same map.
#[derive(Debug, Clone, Default)]
pub struct CorrelationStore {
    records: Arc<DashMap<CorrelationKey, CorrelationRecord>>,
}

impl CorrelationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key`, replacing any previous record
    pub fn set(&self, key: CorrelationKey, value: impl Into<CorrelationValue>) {
        let record = CorrelationRecord {
            key,
            value: value.into(),
            written_at: Utc::now(),
        };
        self.records.insert(key, record);
        tracing::trace!(key = %key, "correlation write");
    }

    /// Read the full record for `key`
    #[must_use]
    pub fn get(&self, key: CorrelationKey) -> Option<CorrelationRecord> {
        self.records.get(&key).map(|entry| entry.value().clone())
    }

    /// Read the value for `key`
    #[must_use]
    pub fn value(&self, key: CorrelationKey) -> Option<CorrelationValue> {
        self.records.get(&key).map(|entry| entry.value().value.clone())
    }

    /// Read an instant; `None` if absent or of another type
    #[must_use]
    pub fn instant(&self, key: CorrelationKey) -> Option<DateTime<Utc>> {
        match self.value(key)? {
            CorrelationValue::Instant(at) => Some(at),
            _ => None,
        }
    }

    /// Read a latency
    #[must_use]
    pub fn elapsed(&self, key: CorrelationKey) -> Option<TimeDelta> {
        match self.value(key)? {
            CorrelationValue::Elapsed(delta) => Some(delta),
            _ => None,
        }
    }

    /// Read text
    #[must_use]
    pub fn text(&self, key: CorrelationKey) -> Option<String> {
        match self.value(key)? {
            CorrelationValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Read a flag
    #[must_use]
    pub fn flag(&self, key: CorrelationKey) -> Option<bool> {
        match self.value(key)? {
            CorrelationValue::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    /// Read a counter; absent counters read as zero
    #[must_use]
    pub fn count(&self, key: CorrelationKey) -> u64 {
        match self.value(key) {
            Some(CorrelationValue::Count(count)) => count,
            _ => 0,
        }
    }

    /// Read a structured payload
    #[must_use]
    pub fn json(&self, key: CorrelationKey) -> Option<serde_json::Value> {
        match self.value(key)? {
            CorrelationValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Atomically add one to a counter and return the new value.
    ///
    /// A non-counter value under `key` is replaced by a count of one.
    pub fn increment(&self, key: CorrelationKey) -> u64 {
        let now = Utc::now();
        let mut entry = self.records.entry(key).or_insert_with(|| CorrelationRecord {
            key,
            value: CorrelationValue::Count(0),
            written_at: now,
        });

        let next = match entry.value {
            CorrelationValue::Count(count) => count.saturating_add(1),
            _ => 1,
        };
        entry.value = CorrelationValue::Count(next);
        entry.written_at = now;
        next
    }

    /// Time since the instant stored under `key`, measured against `now`
    #[must_use]
    pub fn elapsed_since(&self, key: CorrelationKey, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.instant(key).map(|then| now - then)
    }

    /// Whether `key` has ever been written
    #[must_use]
    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.records.contains_key(&key)
    }

    /// Number of keys written
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of every record, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<CorrelationRecord> {
        let mut records: Vec<CorrelationRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.key);
        records
    }
}
