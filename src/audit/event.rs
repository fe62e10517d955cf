//! Ledger Events
//!
//! Security events produced by the firewall, defense and dataset subsystems.
//! The ledger hashes `payload` and `attributes` but never interprets them,
//! apart from the optional risk score and explanation picked up by exports.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Kind of security event recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Login,
    PromptScan,
    OutputScan,
    BlockDecision,
    AllowDecision,
    RuleUpdate,
    DefenseChange,
    DatasetEdit,
    AttackGenerated,
    BenchmarkRun,
    ConfigChange,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::Login,
        EventType::PromptScan,
        EventType::OutputScan,
        EventType::BlockDecision,
        EventType::AllowDecision,
        EventType::RuleUpdate,
        EventType::DefenseChange,
        EventType::DatasetEdit,
        EventType::AttackGenerated,
        EventType::BenchmarkRun,
        EventType::ConfigChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Login => "login",
            EventType::PromptScan => "prompt-scan",
            EventType::OutputScan => "output-scan",
            EventType::BlockDecision => "block-decision",
            EventType::AllowDecision => "allow-decision",
            EventType::RuleUpdate => "rule-update",
            EventType::DefenseChange => "defense-change",
            EventType::DatasetEdit => "dataset-edit",
            EventType::AttackGenerated => "attack-generated",
            EventType::BenchmarkRun => "benchmark-run",
            EventType::ConfigChange => "config-change",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| LedgerError::SerializationError(format!("Unknown event type: {}", s)))
    }
}

/// Opaque JSON blob held in canonical (RFC 8785) form.
///
/// The canonical text is what gets hashed and stored, so the digest does not
/// depend on the key order of whatever produced the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBlob(String);

impl CanonicalBlob {
    /// Canonicalize any serializable value. Fails for values JSON cannot
    /// represent (e.g. maps with non-string keys).
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> LedgerResult<Self> {
        serde_jcs::to_string(value)
            .map(Self)
            .map_err(|e| LedgerError::SerializationError(format!("Failed to canonicalize: {}", e)))
    }

    /// Wrap text read back from a store. Not re-canonicalized: the stored
    /// bytes are exactly what was hashed.
    pub fn from_stored(text: String) -> Self {
        Self(text)
    }

    pub fn empty() -> Self {
        Self("{}".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse into a JSON value; falls back to a JSON string if the stored
    /// text is not valid JSON.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| serde_json::Value::String(self.0.clone()))
    }

    fn lookup(&self, keys: &[&str]) -> Option<serde_json::Value> {
        let value = serde_json::from_str::<serde_json::Value>(&self.0).ok()?;
        let object = value.as_object()?;
        keys.iter().find_map(|key| object.get(*key).cloned())
    }
}

impl Default for CanonicalBlob {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for CanonicalBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CanonicalBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_serializable(&value).map_err(serde::de::Error::custom)
    }
}

/// A security event as handed to the ledger by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub subject_id: Option<String>,
    pub session_id: Option<String>,
    pub payload: CanonicalBlob,
    pub attributes: CanonicalBlob,
}

impl Event {
    /// Create an event with a fresh id, stamped now.
    pub fn new<T: Serialize + ?Sized>(event_type: EventType, payload: &T) -> LedgerResult<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now().trunc_subsecs(6),
            event_type,
            subject_id: None,
            session_id: None,
            payload: CanonicalBlob::from_serializable(payload)?,
            attributes: CanonicalBlob::empty(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Timestamps are kept at microsecond precision, which is what the
    /// content hash and every store preserve.
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at.trunc_subsecs(6);
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attributes<T: Serialize + ?Sized>(mut self, attributes: &T) -> LedgerResult<Self> {
        self.attributes = CanonicalBlob::from_serializable(attributes)?;
        Ok(self)
    }

    /// Risk score (0-100) reported by the classifier, if any.
    pub fn risk_score(&self) -> Option<f64> {
        const KEYS: [&str; 2] = ["riskScore", "risk_score"];
        self.payload
            .lookup(&KEYS)
            .or_else(|| self.attributes.lookup(&KEYS))
            .and_then(|v| v.as_f64())
    }

    /// Human-readable explanation, if the producer supplied one.
    pub fn explanation(&self) -> Option<String> {
        const KEYS: [&str; 3] = ["explanation", "reason", "message"];
        self.payload
            .lookup(&KEYS)
            .or_else(|| self.attributes.lookup(&KEYS))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn summary(&self) -> String {
        format!("{}: {}", self.event_type, self.id)
    }
}
