use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::audit::chain::{
    ChainProof, ChainState, Checkpoint, LedgerRow, ScannedRow, UnreadableRow,
};
use crate::audit::digest::HashDigest;
use crate::audit::event::{CanonicalBlob, Event, EventType};
use crate::error::{LedgerError, LedgerResult};

/// Column values for one `audit_ledger` row.
pub struct LedgerRecord<'a> {
    pub sequence_number: i64,
    pub id: &'a str,
    pub occurred_at: String,
    pub occurred_at_us: i64,
    pub event_type: &'static str,
    pub subject_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub payload: &'a str,
    pub attributes: &'a str,
    pub hash: String,
    pub previous_hash: String,
    pub signature: Option<&'a str>,
    pub chained_at: i64,
}

impl<'a> LedgerRecord<'a> {
    pub fn from_row(row: &'a LedgerRow) -> LedgerResult<Self> {
        Ok(Self {
            sequence_number: to_sql_sequence(row.sequence_number())?,
            id: row.id(),
            occurred_at: format_timestamp(&row.occurred_at()),
            occurred_at_us: row.occurred_at().timestamp_micros(),
            event_type: row.event.event_type.as_str(),
            subject_id: row.event.subject_id.as_deref(),
            session_id: row.event.session_id.as_deref(),
            payload: row.event.payload.as_str(),
            attributes: row.event.attributes.as_str(),
            hash: row.proof.hash.to_hex(),
            previous_hash: row.proof.previous_hash.to_hex(),
            signature: row.proof.signature.as_deref(),
            chained_at: row.proof.chained_at,
        })
    }
}

pub fn to_sql_sequence(sequence_number: u64) -> LedgerResult<i64> {
    i64::try_from(sequence_number).map_err(|_| {
        LedgerError::DatabaseError(format!(
            "Sequence number {} does not fit in an INTEGER column",
            sequence_number
        ))
    })
}

pub fn from_sql_sequence(value: i64) -> LedgerResult<u64> {
    u64::try_from(value)
        .map_err(|_| LedgerError::DatabaseError(format!("Negative sequence number {}", value)))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::SerializationError(format!("Invalid timestamp {}: {}", value, e)))
}

pub fn timestamp_from_micros(micros: i64) -> LedgerResult<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
        LedgerError::SerializationError(format!("Timestamp {}us is out of range", micros))
    })
}

pub fn parse_digest(row: &SqliteRow, column: &str) -> LedgerResult<HashDigest> {
    HashDigest::from_hex(&row.try_get::<String, _>(column)?)
}

/// Decode an `audit_ledger` row. Only a missing sequence number fails the
/// read; any other bad column yields an [`UnreadableRow`].
pub fn decode_ledger_row(row: &SqliteRow) -> LedgerResult<ScannedRow> {
    let sequence_number = from_sql_sequence(row.try_get("sequence_number")?)?;
    let id: String = row.try_get("id").unwrap_or_default();

    match decode_fields(row, sequence_number, &id) {
        Ok(decoded) => Ok(Ok(decoded)),
        Err(e) => Ok(Err(UnreadableRow {
            id,
            sequence_number,
            hash: parse_digest(row, "hash").ok(),
            reason: e.to_string(),
        })),
    }
}

fn decode_fields(row: &SqliteRow, sequence_number: u64, id: &str) -> LedgerResult<LedgerRow> {
    let occurred_at = parse_timestamp(&row.try_get::<String, _>("occurred_at")?)?;
    let event_type: EventType = row.try_get::<String, _>("event_type")?.parse()?;
    let payload = json_blob(row, "payload")?;
    let attributes = json_blob(row, "attributes")?;

    Ok(LedgerRow {
        event: Event {
            id: id.to_string(),
            occurred_at,
            event_type,
            subject_id: row.try_get("subject_id")?,
            session_id: row.try_get("session_id")?,
            payload,
            attributes,
        },
        proof: ChainProof {
            hash: parse_digest(row, "hash")?,
            previous_hash: parse_digest(row, "previous_hash")?,
            signature: row.try_get("signature")?,
            chained_at: row.try_get("chained_at")?,
            sequence_number,
        },
    })
}

/// Stored JSON text, kept byte-for-byte so it hashes as written.
fn json_blob(row: &SqliteRow, column: &str) -> LedgerResult<CanonicalBlob> {
    let text: String = row.try_get(column)?;
    serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
        LedgerError::SerializationError(format!("Column {} is not valid JSON: {}", column, e))
    })?;
    Ok(CanonicalBlob::from_stored(text))
}

pub fn decode_checkpoint(row: &SqliteRow) -> LedgerResult<Checkpoint> {
    Ok(Checkpoint {
        sequence_number: from_sql_sequence(row.try_get("sequence_number")?)?,
        hash: parse_digest(row, "hash")?,
        deleted_count: from_sql_sequence(row.try_get("deleted_count")?)?,
        deleted_root: parse_digest(row, "deleted_root")?,
        cutoff: parse_timestamp(&row.try_get::<String, _>("cutoff")?)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        signature: row.try_get("signature")?,
    })
}

pub fn decode_high_water(row: &SqliteRow) -> LedgerResult<ChainState> {
    Ok(ChainState::at(
        parse_digest(row, "hash")?,
        from_sql_sequence(row.try_get("sequence_number")?)?,
    ))
}
