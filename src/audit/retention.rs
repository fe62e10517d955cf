//! Retention Sweeps
//!
//! Deletes rows older than the retention window. Sweeps hold the writer's
//! lock so no append can race the deletion of its anchor row.
//!
//! Deleting old rows removes the hashes later rows link back to. When the
//! deleted rows form a prefix of the chain, a signed [`Checkpoint`] records
//! the last deleted hash so verification can anchor there instead of at
//! genesis. Rows deleted out of chain order still show up as gaps.
//!
//! Every sweep also records the writer's tip as a high-water mark. The
//! deletion, the checkpoint and the mark are committed together.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::audit::chain::Checkpoint;
use crate::audit::digest::{HashDigest, GENESIS_HASH};
use crate::audit::merkle::merkle_root;
use crate::audit::signer::LedgerSigner;
use crate::audit::store::{LedgerStore, RowRef, SweepCommit};
use crate::audit::writer::LedgerWriter;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub total_entries: u64,
    pub eligible_count: u64,
    pub deleted_count: u64,
    pub retention_days: i64,
    pub cutoff: DateTime<Utc>,
    /// Oldest `occurred_at` before the sweep.
    pub oldest_timestamp: Option<DateTime<Utc>>,
    /// Newest `occurred_at` before the sweep.
    pub newest_timestamp: Option<DateTime<Utc>>,
    /// Sequence number of the checkpoint written by this sweep, if any.
    pub checkpoint_sequence: Option<u64>,
    pub ran_at: DateTime<Utc>,
}

pub struct RetentionManager {
    store: Arc<dyn LedgerStore>,
    signer: Option<LedgerSigner>,
    retention_days: i64,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        signer: Option<LedgerSigner>,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            signer,
            retention_days,
        }
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    /// Number of rows a sweep would delete right now.
    pub async fn pending(&self) -> LedgerResult<u64> {
        let cutoff = cutoff_for(Utc::now(), self.retention_days)?;
        self.store.count_older_than(cutoff).await
    }

    /// Delete every row older than the retention window.
    pub async fn sweep(&self, writer: &LedgerWriter) -> LedgerResult<RetentionReport> {
        self.sweep_with_window(writer, self.retention_days).await
    }

    /// Sweep with an explicit window. Negative windows are rejected before
    /// touching the store.
    pub async fn sweep_with_window(
        &self,
        writer: &LedgerWriter,
        retention_days: i64,
    ) -> LedgerResult<RetentionReport> {
        let cutoff = cutoff_for(Utc::now(), retention_days)?;

        // Appends wait until the sweep is done
        let chain = writer.exclusive().await;

        let stats = self.store.stats().await?;
        let eligible = self.store.older_than(cutoff).await?;
        let eligible_count = eligible.len() as u64;

        let mut report = RetentionReport {
            total_entries: stats.count,
            eligible_count,
            deleted_count: 0,
            retention_days,
            cutoff,
            oldest_timestamp: stats.oldest,
            newest_timestamp: stats.newest,
            checkpoint_sequence: None,
            ran_at: Utc::now(),
        };

        if eligible.is_empty() {
            info!(
                "Retention sweep: nothing older than {} ({} entries kept)",
                cutoff, stats.count
            );
            return Ok(report);
        }

        let start = match self.store.latest_checkpoint().await? {
            Some(checkpoint) => checkpoint.sequence_number + 1,
            None => 1,
        };
        let anchor = prefix_anchor(&eligible, start);

        let checkpoint = anchor
            .map(|anchor| self.checkpoint(anchor, &eligible, eligible_count, cutoff))
            .transpose()?;
        let sweep = SweepCommit {
            cutoff,
            checkpoint,
            high_water: *chain,
        };

        report.deleted_count = match self.store.commit_sweep(&sweep).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!("Retention sweep rolled back, no rows were deleted: {}", e);
                return Err(e);
            }
        };
        info!(
            "Retention sweep deleted {} of {} entries older than {}",
            report.deleted_count, stats.count, cutoff
        );

        if let Some(checkpoint) = &sweep.checkpoint {
            info!(
                "Retention checkpoint written at sequence {} ({})",
                checkpoint.sequence_number,
                checkpoint.hash.short(16)
            );
            report.checkpoint_sequence = Some(checkpoint.sequence_number);
        }

        report.ran_at = Utc::now();
        Ok(report)
    }

    fn checkpoint(
        &self,
        anchor: (u64, HashDigest),
        eligible: &[RowRef],
        deleted_count: u64,
        cutoff: DateTime<Utc>,
    ) -> LedgerResult<Checkpoint> {
        let hashes: Vec<HashDigest> = eligible.iter().filter_map(|r| r.hash).collect();
        let mut checkpoint = Checkpoint {
            sequence_number: anchor.0,
            hash: anchor.1,
            deleted_count,
            deleted_root: merkle_root(&hashes).unwrap_or(GENESIS_HASH),
            cutoff,
            created_at: Utc::now().trunc_subsecs(6),
            signature: None,
        };
        if let Some(signer) = &self.signer {
            checkpoint.signature = Some(signer.sign(checkpoint.canonical_string().as_bytes())?);
        }
        Ok(checkpoint)
    }
}

/// `now - retention_days`, truncated to microseconds.
pub fn cutoff_for(now: DateTime<Utc>, retention_days: i64) -> LedgerResult<DateTime<Utc>> {
    if retention_days < 0 {
        return Err(LedgerError::negative_retention(retention_days));
    }
    let window = Duration::try_days(retention_days).ok_or_else(|| {
        LedgerError::PolicyViolation(format!(
            "Retention window of {} days is out of range",
            retention_days
        ))
    })?;
    Ok(now
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .trunc_subsecs(6))
}

/// Last row of the contiguous run of eligible rows starting at `start`.
fn prefix_anchor(eligible: &[RowRef], start: u64) -> Option<(u64, HashDigest)> {
    let mut expected = start;
    let mut anchor = None;
    for row in eligible {
        match row.hash {
            Some(hash) if row.sequence_number == expected => {
                anchor = Some((row.sequence_number, hash));
                expected += 1;
            }
            _ => break,
        }
    }
    anchor
}
