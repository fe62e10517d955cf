//! Ledger Export
//!
//! Renders ledger rows as JSON, CSV or CEF lines for compliance tooling and
//! SIEM ingestion. Every format carries the sequence number and chain hash
//! so downstream systems can cross-check the chain independently.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::audit::chain::LedgerRow;
use crate::audit::event::EventType;
use crate::config::ExportSettings;
use crate::error::{LedgerError, LedgerResult};

/// Hex characters of the chain hash carried in CEF lines.
const CEF_HASH_PREFIX_LEN: usize = 16;

pub const CSV_HEADER: &str = "id,occurred_at,event_type,subject_id,session_id,risk_score,payload,attributes,sequence_number,hash,previous_hash,signature_present,integrity_verified";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Siem,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Siem => "siem",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "siem" | "cef" => Ok(ExportFormat::Siem),
            other => Err(LedgerError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Row filter applied before formatting.
#[derive(Debug, Clone, Default)]
pub struct ExportQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_type: Option<EventType>,
    pub from_sequence: Option<u64>,
    pub to_sequence: Option<u64>,
}

impl ExportQuery {
    pub fn matches(&self, row: &LedgerRow) -> bool {
        let seq = row.sequence_number();
        self.since.map_or(true, |since| row.occurred_at() >= since)
            && self.until.map_or(true, |until| row.occurred_at() <= until)
            && self.event_type.map_or(true, |t| row.event.event_type == t)
            && self.from_sequence.map_or(true, |from| seq >= from)
            && self.to_sequence.map_or(true, |to| seq <= to)
    }

    /// No row past this sequence number can match.
    pub fn upper_sequence(&self) -> Option<u64> {
        self.to_sequence
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonIntegrity<'a> {
    hash: String,
    previous_hash: String,
    sequence_number: u64,
    signature_present: bool,
    chained_at: i64,
    verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRecord<'a> {
    id: &'a str,
    occurred_at: String,
    event_type: &'static str,
    subject_id: Option<&'a str>,
    session_id: Option<&'a str>,
    payload: serde_json::Value,
    attributes: serde_json::Value,
    integrity: JsonIntegrity<'a>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportFormatter {
    settings: ExportSettings,
}

impl ExportFormatter {
    pub fn new(settings: ExportSettings) -> Self {
        Self { settings }
    }

    pub fn export(&self, rows: &[LedgerRow], format: ExportFormat) -> LedgerResult<String> {
        match format {
            ExportFormat::Json => self.to_json(rows),
            ExportFormat::Csv => Ok(self.to_csv(rows)),
            ExportFormat::Siem => Ok(self.to_cef(rows)),
        }
    }

    fn to_json(&self, rows: &[LedgerRow]) -> LedgerResult<String> {
        let records: Vec<JsonRecord<'_>> = rows
            .iter()
            .map(|row| JsonRecord {
                id: row.id(),
                occurred_at: iso8601(&row.occurred_at()),
                event_type: row.event.event_type.as_str(),
                subject_id: row.event.subject_id.as_deref(),
                session_id: row.event.session_id.as_deref(),
                payload: row.event.payload.to_value(),
                attributes: row.event.attributes.to_value(),
                integrity: JsonIntegrity {
                    hash: row.proof.hash.to_hex(),
                    previous_hash: row.proof.previous_hash.to_hex(),
                    sequence_number: row.sequence_number(),
                    signature_present: row.proof.signature.is_some(),
                    chained_at: row.proof.chained_at,
                    verified: row.is_self_consistent(),
                    signature: row.proof.signature.as_deref(),
                },
            })
            .collect();

        Ok(serde_json::to_string_pretty(&records)?)
    }

    fn to_csv(&self, rows: &[LedgerRow]) -> String {
        let mut lines = Vec::with_capacity(rows.len() + 1);
        lines.push(CSV_HEADER.to_string());

        for row in rows {
            let fields = [
                csv_field(row.id()),
                csv_field(&iso8601(&row.occurred_at())),
                csv_field(row.event.event_type.as_str()),
                csv_field(row.event.subject_id.as_deref().unwrap_or("")),
                csv_field(row.event.session_id.as_deref().unwrap_or("")),
                row.event
                    .risk_score()
                    .map(|score| score.to_string())
                    .unwrap_or_default(),
                csv_field(row.event.payload.as_str()),
                csv_field(row.event.attributes.as_str()),
                row.sequence_number().to_string(),
                row.proof.hash.to_hex(),
                row.proof.previous_hash.to_hex(),
                row.proof.signature.is_some().to_string(),
                row.is_self_consistent().to_string(),
            ];
            lines.push(fields.join(","));
        }

        let mut out = lines.join("\r\n");
        out.push_str("\r\n");
        out
    }

    fn to_cef(&self, rows: &[LedgerRow]) -> String {
        rows.iter()
            .map(|row| self.cef_line(row))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn cef_line(&self, row: &LedgerRow) -> String {
        let event_type = row.event.event_type.as_str();
        let mut extensions = vec![format!("rt={}", row.occurred_at().timestamp())];

        if let Some(subject) = &row.event.subject_id {
            extensions.push(format!("suid={}", cef_extension(subject)));
        }
        if let Some(session) = &row.event.session_id {
            extensions.push(format!("cs1={} cs1Label=SessionId", cef_extension(session)));
        }
        extensions.push(format!("cs2={} cs2Label=EventId", cef_extension(row.id())));
        extensions.push(format!(
            "cs3={} cs3Label=SequenceNumber",
            row.sequence_number()
        ));
        extensions.push(format!(
            "cs4={} cs4Label=IntegrityHash",
            row.proof.hash.short(CEF_HASH_PREFIX_LEN)
        ));

        let message = row
            .event
            .explanation()
            .unwrap_or_else(|| row.event.summary());
        extensions.push(format!("msg={}", cef_extension(&message)));

        format!(
            "CEF:0|{}|{}|{}|{}|{}|{}|{}",
            cef_header(&self.settings.vendor),
            cef_header(&self.settings.product),
            cef_header(&self.settings.version),
            event_type,
            event_type,
            severity(row),
            extensions.join(" ")
        )
    }
}

fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC 4180 quoting.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn cef_header(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

fn cef_extension(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('|', "\\|")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// CEF severity 1-10 from a 0-100 risk score, or a per-type default.
fn severity(row: &LedgerRow) -> u8 {
    match row.event.risk_score() {
        Some(score) if score.is_finite() => (score / 10.0).ceil().clamp(1.0, 10.0) as u8,
        _ => match row.event.event_type {
            EventType::BlockDecision => 7,
            EventType::AttackGenerated => 6,
            EventType::RuleUpdate | EventType::DefenseChange | EventType::ConfigChange => 5,
            EventType::DatasetEdit => 4,
            _ => 3,
        },
    }
}
