//! Audit Ledger
//!
//! Tamper-evident, append-only storage for security events. Every row is
//! linked to its predecessor by a SHA-256 hash chain and optionally signed
//! with an HMAC key, so edits, deletions and reordering are detectable.

pub mod chain;
pub mod digest;
pub mod event;
pub mod export;
pub mod hasher;
pub mod ledger;
pub mod merkle;
pub mod retention;
pub mod signer;
pub mod store;
pub mod verify;
pub mod writer;

pub use chain::{ChainProof, ChainState, Checkpoint, LedgerRow, ScannedRow, UnreadableRow};
pub use digest::{HashDigest, GENESIS_HASH, LEDGER_FORMAT_VERSION};
pub use event::{CanonicalBlob, Event, EventType};
pub use export::{ExportFormat, ExportFormatter, ExportQuery};
pub use ledger::AuditLedger;
pub use merkle::merkle_root;
pub use retention::{RetentionManager, RetentionReport};
pub use signer::{LedgerSigner, SigningKey};
pub use store::{LedgerStore, MemoryStore, RowRef, StoreStats, SweepCommit};
pub use verify::{
    ChainCursor, IntegrityVerifier, VerificationReport, VerificationStatus, VerifyOptions,
};
pub use writer::LedgerWriter;
