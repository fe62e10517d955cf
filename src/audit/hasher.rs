//! Content Hasher
//!
//! Canonicalizes an event's fields in a fixed order and digests them, and
//! binds content hashes into the chain.

use chrono::SecondsFormat;

use crate::audit::digest::{HashDigest, LEDGER_FORMAT_VERSION};
use crate::audit::event::Event;

/// Canonical string for an event's own fields.
///
/// Field order is part of the digest definition:
/// id, occurred_at, event_type, subject_id, session_id, payload, attributes.
/// Every value is JSON-encoded so no field can bleed into the next one.
pub fn canonical_string(event: &Event) -> String {
    format!(
        "v{}|id:{}|occurred_at:{}|event_type:{}|subject_id:{}|session_id:{}|payload:{}|attributes:{}",
        LEDGER_FORMAT_VERSION,
        quote(Some(&event.id)),
        quote(Some(
            &event
                .occurred_at
                .to_rfc3339_opts(SecondsFormat::Micros, true)
        )),
        quote(Some(event.event_type.as_str())),
        quote(event.subject_id.as_deref()),
        quote(event.session_id.as_deref()),
        quote(Some(event.payload.as_str())),
        quote(Some(event.attributes.as_str())),
    )
}

/// Digest of the event alone, independent of its chain position.
pub fn content_hash(event: &Event) -> HashDigest {
    HashDigest::of(canonical_string(event).as_bytes())
}

/// `H(previous_hash ":" content_hash ":" sequence_number)`
pub fn chain_hash(
    previous_hash: &HashDigest,
    content_hash: &HashDigest,
    sequence_number: u64,
) -> HashDigest {
    let material = format!("{}:{}:{}", previous_hash, content_hash, sequence_number);
    HashDigest::of(material.as_bytes())
}

fn quote(value: Option<&str>) -> String {
    match value {
        Some(v) => serde_json::Value::String(v.to_string()).to_string(),
        None => "null".to_string(),
    }
}
