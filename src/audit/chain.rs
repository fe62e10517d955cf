//! Chain Types
//!
//! The chain tip, the per-row proof, stored rows and retention checkpoints.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::digest::{HashDigest, GENESIS_HASH};
use crate::audit::event::Event;
use crate::audit::hasher;

/// Tip of the ledger: the hash and sequence number of the newest row.
///
/// Only the ledger writer advances it; everyone else sees copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    last_hash: HashDigest,
    last_sequence_number: u64,
}

impl ChainState {
    pub fn genesis() -> Self {
        Self {
            last_hash: GENESIS_HASH,
            last_sequence_number: 0,
        }
    }

    pub(crate) fn at(last_hash: HashDigest, last_sequence_number: u64) -> Self {
        Self {
            last_hash,
            last_sequence_number,
        }
    }

    pub fn last_hash(&self) -> HashDigest {
        self.last_hash
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.last_sequence_number + 1
    }

    pub fn is_genesis(&self) -> bool {
        self.last_sequence_number == 0
    }

    pub(crate) fn advance(&mut self, hash: HashDigest, sequence_number: u64) {
        self.last_hash = hash;
        self.last_sequence_number = sequence_number;
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Integrity fields attached to every stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainProof {
    pub hash: HashDigest,
    pub previous_hash: HashDigest,
    /// Hex HMAC of `hash`, present when signatures are required.
    pub signature: Option<String>,
    /// Epoch milliseconds at which the row was chained.
    pub chained_at: i64,
    pub sequence_number: u64,
}

/// An event together with its chain proof. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub event: Event,
    pub proof: ChainProof,
}

impl LedgerRow {
    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn sequence_number(&self) -> u64 {
        self.proof.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.event.occurred_at
    }

    pub fn chained_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.proof.chained_at)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Chain hash re-derived from the row's own content, previous hash and
    /// sequence number.
    pub fn recompute_hash(&self) -> HashDigest {
        let content = hasher::content_hash(&self.event);
        hasher::chain_hash(
            &self.proof.previous_hash,
            &content,
            self.proof.sequence_number,
        )
    }

    /// Whether the stored hash matches the row's content. Says nothing about
    /// the link to the previous row.
    pub fn is_self_consistent(&self) -> bool {
        self.recompute_hash() == self.proof.hash
    }
}

/// A row the store could not decode. Verification reports it as corrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRow {
    pub id: String,
    pub sequence_number: u64,
    /// Stored hash, if that column was still readable.
    pub hash: Option<HashDigest>,
    pub reason: String,
}

pub type ScannedRow = Result<LedgerRow, UnreadableRow>;

/// Sequence number of a scanned row, readable or not.
pub fn scanned_sequence(row: &ScannedRow) -> u64 {
    match row {
        Ok(row) => row.sequence_number(),
        Err(unreadable) => unreadable.sequence_number,
    }
}

/// Signed anchor written when a retention sweep removes a prefix of the chain.
///
/// Verification resumes from `hash` at `sequence_number + 1` instead of from
/// genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Sequence number of the last deleted row of the prefix.
    pub sequence_number: u64,
    /// That row's chain hash.
    pub hash: HashDigest,
    pub deleted_count: u64,
    /// Merkle root over the hashes of every row deleted by the sweep.
    pub deleted_root: HashDigest,
    pub cutoff: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub signature: Option<String>,
}

impl Checkpoint {
    pub fn id(&self) -> String {
        format!("checkpoint:{}", self.sequence_number)
    }

    /// Bytes covered by the checkpoint signature.
    pub fn canonical_string(&self) -> String {
        format!(
            "checkpoint|sequence_number:{}|hash:{}|deleted_count:{}|deleted_root:{}|cutoff:{}|created_at:{}",
            self.sequence_number,
            self.hash,
            self.deleted_count,
            self.deleted_root,
            self.cutoff.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        )
    }

    /// Chain state the verifier starts from.
    pub fn anchor(&self) -> ChainState {
        ChainState::at(self.hash, self.sequence_number)
    }
}
