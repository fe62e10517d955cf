//! Ledger Store
//!
//! The persistence seam for the ledger: ordered storage keyed by sequence
//! number. [`MemoryStore`] backs tests and embedded use; the SQLite
//! implementation lives in [`crate::database`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::audit::chain::{ChainState, Checkpoint, LedgerRow, ScannedRow, UnreadableRow};
use crate::audit::digest::HashDigest;
use crate::error::{LedgerError, LedgerResult};

/// Row count and time span of the stored ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Sequence number and stored hash of a row, without its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub sequence_number: u64,
    pub hash: Option<HashDigest>,
}

/// Everything one retention sweep writes. Stores apply it all or nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCommit {
    /// Rows with `occurred_at` strictly before this are deleted.
    pub cutoff: DateTime<Utc>,
    /// Anchor for a deleted prefix of the chain.
    pub checkpoint: Option<Checkpoint>,
    /// Writer tip when the sweep ran. Sequence numbers at or below it are
    /// never handed out again, even if every row up to it is deleted.
    pub high_water: ChainState,
}

/// Ordered row storage for one ledger.
///
/// Implementations must reject a second row with an existing sequence
/// number and must return scans in ascending sequence order.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a new row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateSequence`] if the sequence number is
    /// taken, or a database error if the row cannot be written.
    async fn insert(&self, row: &LedgerRow) -> LedgerResult<()>;

    /// Up to `limit` rows with sequence number greater than `after`, ascending.
    async fn scan_ordered(&self, after: u64, limit: usize) -> LedgerResult<Vec<ScannedRow>>;

    /// The row with the highest sequence number.
    async fn latest(&self) -> LedgerResult<Option<ScannedRow>>;

    /// Rows whose `occurred_at` is strictly before `cutoff`, ascending by sequence.
    async fn older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<RowRef>>;

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64>;

    /// Delete every row whose `occurred_at` is strictly before the sweep's
    /// cutoff, store its checkpoint and raise the high-water mark, as one
    /// atomic change. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// On any error nothing is deleted and nothing is recorded.
    async fn commit_sweep(&self, sweep: &SweepCommit) -> LedgerResult<u64>;

    async fn stats(&self) -> LedgerResult<StoreStats>;

    /// The checkpoint with the highest sequence number.
    async fn latest_checkpoint(&self) -> LedgerResult<Option<Checkpoint>>;

    /// Highest chain tip recorded by any sweep.
    async fn high_water(&self) -> LedgerResult<Option<ChainState>>;
}

#[derive(Default)]
struct MemoryInner {
    rows: BTreeMap<u64, LedgerRow>,
    ids: HashSet<String>,
    checkpoints: BTreeMap<u64, Checkpoint>,
    high_water: Option<ChainState>,
    unreadable: HashMap<u64, String>,
    fail_reads: bool,
    fail_writes: bool,
}

/// In-process store keyed by sequence number.
///
/// Besides the [`LedgerStore`] operations it exposes hooks for simulating
/// out-of-band tampering and store outages.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored row in place, bypassing the ledger.
    pub async fn tamper<F>(&self, sequence_number: u64, mutate: F) -> bool
    where
        F: FnOnce(&mut LedgerRow),
    {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&sequence_number) {
            Some(row) => {
                mutate(row);
                true
            }
            None => false,
        }
    }

    /// Delete a row without leaving any record.
    pub async fn remove(&self, sequence_number: u64) -> Option<LedgerRow> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.remove(&sequence_number)?;
        inner.ids.remove(row.id());
        Some(row)
    }

    /// Make a row fail to decode on subsequent reads.
    pub async fn mark_unreadable(&self, sequence_number: u64, reason: impl Into<String>) {
        self.inner
            .write()
            .await
            .unreadable
            .insert(sequence_number, reason.into());
    }

    pub async fn set_fail_reads(&self, fail: bool) {
        self.inner.write().await.fail_reads = fail;
    }

    pub async fn set_fail_writes(&self, fail: bool) {
        self.inner.write().await.fail_writes = fail;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rows.is_empty()
    }

    pub async fn get(&self, sequence_number: u64) -> Option<LedgerRow> {
        self.inner.read().await.rows.get(&sequence_number).cloned()
    }
}

impl MemoryInner {
    fn check_reads(&self) -> LedgerResult<()> {
        if self.fail_reads {
            return Err(LedgerError::DatabaseError(
                "memory store is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn scanned(&self, row: &LedgerRow) -> ScannedRow {
        match self.unreadable.get(&row.sequence_number()) {
            Some(reason) => Err(UnreadableRow {
                id: row.id().to_string(),
                sequence_number: row.sequence_number(),
                hash: Some(row.proof.hash),
                reason: reason.clone(),
            }),
            None => Ok(row.clone()),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert(&self, row: &LedgerRow) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        if inner.fail_writes {
            return Err(LedgerError::DatabaseError(
                "memory store rejected the write".to_string(),
            ));
        }
        if inner.rows.contains_key(&row.sequence_number()) {
            return Err(LedgerError::DuplicateSequence(row.sequence_number()));
        }
        if inner.ids.contains(row.id()) {
            return Err(LedgerError::DatabaseError(format!(
                "Event id {} already exists in the ledger",
                row.id()
            )));
        }
        inner.ids.insert(row.id().to_string());
        inner.rows.insert(row.sequence_number(), row.clone());
        Ok(())
    }

    async fn scan_ordered(&self, after: u64, limit: usize) -> LedgerResult<Vec<ScannedRow>> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner
            .rows
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, row)| inner.scanned(row))
            .collect())
    }

    async fn latest(&self) -> LedgerResult<Option<ScannedRow>> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner
            .rows
            .values()
            .next_back()
            .map(|row| inner.scanned(row)))
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<RowRef>> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.occurred_at() < cutoff)
            .map(|row| RowRef {
                sequence_number: row.sequence_number(),
                hash: Some(row.proof.hash),
            })
            .collect())
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.occurred_at() < cutoff)
            .count() as u64)
    }

    async fn commit_sweep(&self, sweep: &SweepCommit) -> LedgerResult<u64> {
        // One write lock covers the whole sweep
        let mut inner = self.inner.write().await;
        if inner.fail_writes {
            return Err(LedgerError::DatabaseError(
                "memory store rejected the sweep".to_string(),
            ));
        }
        let doomed: Vec<(u64, String)> = inner
            .rows
            .values()
            .filter(|row| row.occurred_at() < sweep.cutoff)
            .map(|row| (row.sequence_number(), row.id().to_string()))
            .collect();
        for (sequence_number, id) in &doomed {
            inner.rows.remove(sequence_number);
            inner.ids.remove(id);
        }
        if let Some(checkpoint) = &sweep.checkpoint {
            inner
                .checkpoints
                .insert(checkpoint.sequence_number, checkpoint.clone());
        }
        let raised = inner.high_water.map_or(true, |mark| {
            sweep.high_water.last_sequence_number() > mark.last_sequence_number()
        });
        if raised {
            inner.high_water = Some(sweep.high_water);
        }
        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> LedgerResult<StoreStats> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(StoreStats {
            count: inner.rows.len() as u64,
            oldest: inner.rows.values().map(LedgerRow::occurred_at).min(),
            newest: inner.rows.values().map(LedgerRow::occurred_at).max(),
        })
    }

    async fn latest_checkpoint(&self) -> LedgerResult<Option<Checkpoint>> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner.checkpoints.values().next_back().cloned())
    }

    async fn high_water(&self) -> LedgerResult<Option<ChainState>> {
        let inner = self.inner.read().await;
        inner.check_reads()?;
        Ok(inner.high_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::ChainProof;
    use crate::audit::digest::GENESIS_HASH;
    use crate::audit::event::{Event, EventType};
    use chrono::{Duration, SubsecRound};
    use serde_json::json;

    fn row(sequence_number: u64, age_days: i64) -> LedgerRow {
        row_at(sequence_number, Utc::now() - Duration::days(age_days))
    }

    fn row_at(sequence_number: u64, occurred_at: DateTime<Utc>) -> LedgerRow {
        let event = Event::new(EventType::PromptScan, &json!({"n": sequence_number}))
            .unwrap()
            .at(occurred_at);
        LedgerRow {
            event,
            proof: ChainProof {
                hash: HashDigest::of(&sequence_number.to_be_bytes()),
                previous_hash: GENESIS_HASH,
                signature: None,
                chained_at: 0,
                sequence_number,
            },
        }
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let store = MemoryStore::new();
        store.insert(&row(1, 0)).await.unwrap();
        let err = store.insert(&row(1, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateSequence(1)));
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_paged() {
        let store = MemoryStore::new();
        for seq in [3, 1, 2, 5, 4] {
            store.insert(&row(seq, 0)).await.unwrap();
        }

        let page: Vec<u64> = store
            .scan_ordered(1, 3)
            .await
            .unwrap()
            .iter()
            .map(crate::audit::chain::scanned_sequence)
            .collect();
        assert_eq!(page, vec![2, 3, 4]);

        let latest = store.latest().await.unwrap().unwrap().unwrap();
        assert_eq!(latest.sequence_number(), 5);
    }

    fn sweep(cutoff: DateTime<Utc>, tip: u64) -> SweepCommit {
        SweepCommit {
            cutoff,
            checkpoint: None,
            high_water: ChainState::at(HashDigest::of(&tip.to_be_bytes()), tip),
        }
    }

    #[tokio::test]
    async fn test_commit_sweep_deletes_older_rows() {
        let store = MemoryStore::new();
        store.insert(&row(1, 10)).await.unwrap();
        store.insert(&row(2, 5)).await.unwrap();
        store.insert(&row(3, 0)).await.unwrap();

        let cutoff = Utc::now() - Duration::days(3);
        assert_eq!(store.count_older_than(cutoff).await.unwrap(), 2);
        assert_eq!(store.older_than(cutoff).await.unwrap().len(), 2);
        assert_eq!(store.commit_sweep(&sweep(cutoff, 3)).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get(3).await.is_some());
        let mark = store.high_water().await.unwrap().unwrap();
        assert_eq!(mark.last_sequence_number(), 3);
    }

    #[tokio::test]
    async fn test_cutoff_is_strict() {
        let cutoff = Utc::now().trunc_subsecs(6) - Duration::days(30);
        let store = MemoryStore::new();
        for (seq, offset) in [(1u64, -1i64), (2, 0), (3, 1)] {
            store
                .insert(&row_at(seq, cutoff + Duration::microseconds(offset)))
                .await
                .unwrap();
        }

        let expired = store.older_than(cutoff).await.unwrap();
        assert_eq!(
            expired.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(store.count_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(store.commit_sweep(&sweep(cutoff, 3)).await.unwrap(), 1);
        assert!(store.get(1).await.is_none());
        assert!(store.get(2).await.is_some());
        assert!(store.get(3).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_sweep_changes_nothing() {
        let store = MemoryStore::new();
        store.insert(&row(1, 10)).await.unwrap();
        store.set_fail_writes(true).await;

        let cutoff = Utc::now() - Duration::days(3);
        assert!(store.commit_sweep(&sweep(cutoff, 1)).await.is_err());
        assert_eq!(store.len().await, 1);

        store.set_fail_writes(false).await;
        assert!(store.high_water().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_high_water_never_lowers() {
        let store = MemoryStore::new();
        let cutoff = Utc::now();
        store.commit_sweep(&sweep(cutoff, 9)).await.unwrap();
        store.commit_sweep(&sweep(cutoff, 4)).await.unwrap();
        let mark = store.high_water().await.unwrap().unwrap();
        assert_eq!(mark.last_sequence_number(), 9);
    }

    #[tokio::test]
    async fn test_unreadable_rows_surface_as_errors() {
        let store = MemoryStore::new();
        store.insert(&row(1, 0)).await.unwrap();
        store.mark_unreadable(1, "bad payload").await;

        let scanned = store.scan_ordered(0, 10).await.unwrap();
        let unreadable = scanned[0].as_ref().unwrap_err();
        assert_eq!(unreadable.sequence_number, 1);
        assert_eq!(unreadable.reason, "bad payload");
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let store = MemoryStore::new();
        store.set_fail_reads(true).await;
        assert!(store.scan_ordered(0, 10).await.is_err());
        assert!(store.latest().await.is_err());
    }
}
