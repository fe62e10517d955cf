//! Ledger Verification
//!
//! Re-derives the chain from stored rows and reports every discrepancy.
//! Tampering is reported as data in a [`VerificationReport`]; verification
//! itself never fails with an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::chain::{scanned_sequence, Checkpoint, ScannedRow};
use crate::audit::digest::{HashDigest, GENESIS_HASH};
use crate::audit::signer::LedgerSigner;
use crate::audit::store::LedgerStore;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Outcome of a verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every scanned row re-derived and no sequence numbers are missing.
    Verified,
    /// The scan completed and found corrupted rows or gaps.
    TamperDetected,
    /// The scan was cancelled or ran past its deadline.
    Incomplete,
    /// The store could not be read; nothing can be concluded.
    Unavailable,
}

/// Where a verification pass stopped, so a later pass can pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCursor {
    /// Last sequence number examined.
    pub sequence_number: u64,
    /// Hash the next row must link to; `None` if the last row was unreadable.
    pub expected_previous: Option<HashDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub is_valid: bool,
    pub status: VerificationStatus,
    pub total_entries: u64,
    pub verified_entries: u64,
    pub corrupted_ids: Vec<String>,
    pub missing_sequence_gaps: Vec<u64>,
    pub last_verified_sequence: u64,
    /// Sequence number the chain was anchored at: 0 for genesis, otherwise
    /// the retention checkpoint.
    pub anchor_sequence: u64,
    pub resume_from: Option<ChainCursor>,
    pub error: Option<String>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    fn empty(anchor_sequence: u64) -> Self {
        Self {
            is_valid: false,
            status: VerificationStatus::Incomplete,
            total_entries: 0,
            verified_entries: 0,
            corrupted_ids: Vec::new(),
            missing_sequence_gaps: Vec::new(),
            last_verified_sequence: 0,
            anchor_sequence,
            resume_from: None,
            error: None,
            verified_at: Utc::now(),
        }
    }

    fn unavailable(error: String) -> Self {
        let mut report = Self::empty(0);
        report.status = VerificationStatus::Unavailable;
        report.error = Some(error);
        report
    }

    fn has_findings(&self) -> bool {
        !self.corrupted_ids.is_empty() || !self.missing_sequence_gaps.is_empty()
    }

    fn finalize(mut self, cut_short: bool) -> Self {
        self.status = if self.error.is_some() {
            VerificationStatus::Unavailable
        } else if cut_short {
            VerificationStatus::Incomplete
        } else if self.has_findings() {
            VerificationStatus::TamperDetected
        } else {
            VerificationStatus::Verified
        };
        self.is_valid = self.status == VerificationStatus::Verified;
        if !cut_short {
            self.resume_from = None;
        }
        self.verified_at = Utc::now();
        self
    }

    /// Combine an incomplete report with the report of the pass that resumed it.
    pub fn merge(mut self, next: VerificationReport) -> Self {
        self.total_entries += next.total_entries;
        self.verified_entries += next.verified_entries;
        self.corrupted_ids.extend(next.corrupted_ids);
        self.missing_sequence_gaps.extend(next.missing_sequence_gaps);
        self.last_verified_sequence = self.last_verified_sequence.max(next.last_verified_sequence);
        self.resume_from = next.resume_from;
        self.error = self.error.or(next.error);
        let cut_short = next.status == VerificationStatus::Incomplete;
        self.finalize(cut_short)
    }

    pub fn summary(&self) -> String {
        match self.status {
            VerificationStatus::Verified => format!(
                "Ledger is valid ({} entries verified, last sequence {})",
                self.verified_entries, self.last_verified_sequence
            ),
            VerificationStatus::TamperDetected => format!(
                "Ledger integrity violated: {} corrupted entries, {} sequence gaps ({} of {} entries verified)",
                self.corrupted_ids.len(),
                self.missing_sequence_gaps.len(),
                self.verified_entries,
                self.total_entries
            ),
            VerificationStatus::Incomplete => format!(
                "Verification incomplete after {} entries; resume from sequence {}",
                self.total_entries,
                self.resume_from.map(|c| c.sequence_number).unwrap_or(0)
            ),
            VerificationStatus::Unavailable => format!(
                "Could not verify ledger: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Bounds and resume point for a verification pass.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub batch_size: usize,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub resume: Option<ChainCursor>,
    /// Sequence number of the writer's tip when the pass started. Rows
    /// missing from the end of the ledger are reported as a gap.
    pub expected_head: Option<u64>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            deadline: None,
            cancel: None,
            resume: None,
            expected_head: None,
        }
    }
}

impl VerifyOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn resume_from(mut self, cursor: ChainCursor) -> Self {
        self.resume = Some(cursor);
        self
    }

    pub fn with_expected_head(mut self, head: u64) -> Self {
        self.expected_head = Some(head);
        self
    }
}

/// Read-only chain verifier. Safe to run concurrently with appends and
/// with other verifiers.
pub struct IntegrityVerifier {
    store: Arc<dyn LedgerStore>,
    signer: Option<LedgerSigner>,
    signature_required: bool,
}

/// Running state of one pass.
struct Scan {
    expected_previous: Option<HashDigest>,
    expected_sequence: u64,
    report: VerificationReport,
}

impl IntegrityVerifier {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        signer: Option<LedgerSigner>,
        signature_required: bool,
    ) -> Self {
        Self {
            store,
            signer,
            signature_required,
        }
    }

    /// Verify the whole ledger with default options.
    pub async fn verify(&self) -> VerificationReport {
        self.verify_with(VerifyOptions::default()).await
    }

    pub async fn verify_with(&self, options: VerifyOptions) -> VerificationReport {
        let started = Instant::now();
        let batch_size = options.batch_size.max(1);

        let mut scan = match options.resume {
            Some(cursor) => Scan {
                expected_previous: cursor.expected_previous,
                expected_sequence: cursor.sequence_number + 1,
                report: VerificationReport::empty(cursor.sequence_number),
            },
            None => match self.anchor().await {
                Ok(scan) => scan,
                Err(e) => {
                    error!("Ledger verification could not start: {}", e);
                    return VerificationReport::unavailable(e);
                }
            },
        };

        let mut after = scan.expected_sequence - 1;
        let mut cut_short = false;

        loop {
            let cancelled = options
                .cancel
                .as_ref()
                .map(CancellationToken::is_cancelled)
                .unwrap_or(false);
            let expired = options
                .deadline
                .map(|deadline| started.elapsed() >= deadline)
                .unwrap_or(false);
            if cancelled || expired {
                warn!(
                    "Ledger verification stopped after sequence {} ({})",
                    after,
                    if cancelled { "cancelled" } else { "deadline reached" }
                );
                scan.report.resume_from = Some(ChainCursor {
                    sequence_number: after,
                    expected_previous: scan.expected_previous,
                });
                cut_short = true;
                break;
            }

            let page = match self.store.scan_ordered(after, batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!("Ledger verification aborted by store error: {}", e);
                    scan.report.error = Some(e.to_string());
                    break;
                }
            };

            if page.is_empty() {
                break;
            }

            if scan.report.total_entries == 0 {
                let first = scanned_sequence(&page[0]);
                if first > scan.expected_sequence {
                    self.catch_up_anchor(&mut scan, first).await;
                }
            }

            for row in page {
                after = self.check_row(&mut scan, row);
            }
        }

        if !cut_short && scan.report.error.is_none() {
            if let Some(head) = options.expected_head {
                if head >= scan.expected_sequence {
                    warn!(
                        "Ledger ends at sequence {} but the writer is at {}",
                        scan.expected_sequence - 1,
                        head
                    );
                    scan.report.missing_sequence_gaps.push(scan.expected_sequence);
                }
            }
        }

        let report = scan.report.finalize(cut_short);
        info!("{}", report.summary());
        report
    }

    /// Starting point: the latest trusted retention checkpoint, or genesis.
    async fn anchor(&self) -> Result<Scan, String> {
        let checkpoint = self
            .store
            .latest_checkpoint()
            .await
            .map_err(|e| e.to_string())?;

        let genesis = Scan {
            expected_previous: Some(GENESIS_HASH),
            expected_sequence: 1,
            report: VerificationReport::empty(0),
        };

        let Some(checkpoint) = checkpoint else {
            return Ok(genesis);
        };

        if !self.checkpoint_trusted(&checkpoint) {
            warn!(
                "Retention checkpoint at sequence {} failed signature verification; anchoring at genesis",
                checkpoint.sequence_number
            );
            let mut scan = genesis;
            scan.report.corrupted_ids.push(checkpoint.id());
            return Ok(scan);
        }

        Ok(Scan {
            expected_previous: Some(checkpoint.hash),
            expected_sequence: checkpoint.sequence_number + 1,
            report: VerificationReport::empty(checkpoint.sequence_number),
        })
    }

    /// The chain starts later than the anchor says. A sweep that committed
    /// after the anchor was read explains that; re-anchor on its checkpoint.
    async fn catch_up_anchor(&self, scan: &mut Scan, first_sequence: u64) {
        let checkpoint = match self.store.latest_checkpoint().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not re-read retention checkpoint: {}", e);
                return;
            }
        };

        let covers_gap = checkpoint.sequence_number >= scan.expected_sequence
            && checkpoint.sequence_number < first_sequence;
        if !covers_gap || !self.checkpoint_trusted(&checkpoint) {
            return;
        }

        info!(
            "Retention sweep ran during verification; anchoring at checkpoint {}",
            checkpoint.sequence_number
        );
        scan.expected_previous = Some(checkpoint.hash);
        scan.expected_sequence = checkpoint.sequence_number + 1;
        scan.report.anchor_sequence = checkpoint.sequence_number;
    }

    fn checkpoint_trusted(&self, checkpoint: &Checkpoint) -> bool {
        match (&self.signer, checkpoint.signature.as_deref()) {
            (Some(signer), Some(signature)) => {
                signer.verify(checkpoint.canonical_string().as_bytes(), signature)
            }
            (_, None) => !self.signature_required,
            (None, Some(_)) => !self.signature_required,
        }
    }

    /// Check one row and advance the scan. Returns the row's sequence number.
    fn check_row(&self, scan: &mut Scan, row: ScannedRow) -> u64 {
        let report = &mut scan.report;
        report.total_entries += 1;

        let sequence_number = scanned_sequence(&row);

        if sequence_number != scan.expected_sequence {
            warn!(
                "Sequence gap: expected {}, found {}",
                scan.expected_sequence, sequence_number
            );
            report.missing_sequence_gaps.push(scan.expected_sequence);
            scan.expected_sequence = sequence_number;
        }

        match row {
            Ok(row) => {
                let mut corrupted = false;

                if let Some(expected) = scan.expected_previous {
                    if row.proof.previous_hash != expected {
                        warn!("Row {} (sequence {}) breaks the chain link", row.id(), sequence_number);
                        corrupted = true;
                    }
                }

                if !row.is_self_consistent() {
                    warn!("Row {} (sequence {}) does not match its hash", row.id(), sequence_number);
                    corrupted = true;
                }

                if !self.signature_valid(&row.proof.hash, row.proof.signature.as_deref()) {
                    warn!("Row {} (sequence {}) has an invalid signature", row.id(), sequence_number);
                    corrupted = true;
                }

                if corrupted {
                    report.corrupted_ids.push(row.id().to_string());
                } else {
                    report.verified_entries += 1;
                    report.last_verified_sequence = sequence_number;
                }

                // Trust the stored hash going forward so one bad row is
                // reported once instead of cascading.
                scan.expected_previous = Some(row.proof.hash);
            }
            Err(unreadable) => {
                warn!(
                    "Row {} (sequence {}) is unreadable: {}",
                    unreadable.id, sequence_number, unreadable.reason
                );
                report.corrupted_ids.push(unreadable.id);
                scan.expected_previous = unreadable.hash;
            }
        }

        scan.expected_sequence += 1;
        sequence_number
    }

    fn signature_valid(&self, hash: &HashDigest, signature: Option<&str>) -> bool {
        if !self.signature_required {
            return true;
        }
        match (&self.signer, signature) {
            (Some(signer), Some(signature)) => signer.verify_digest(hash, signature),
            _ => false,
        }
    }
}
