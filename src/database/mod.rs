pub mod models;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::audit::chain::{ChainState, Checkpoint, LedgerRow, ScannedRow};
use crate::audit::store::{LedgerStore, RowRef, StoreStats, SweepCommit};
use crate::error::{LedgerError, LedgerResult};
use models::{
    decode_checkpoint, decode_high_water, decode_ledger_row, format_timestamp, from_sql_sequence, parse_digest,
    timestamp_from_micros, to_sql_sequence, LedgerRecord,
};

/// SQLite-backed ledger store.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        if database_url.contains(":memory:") {
            return Self::new_in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| LedgerError::ConfigError(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                LedgerError::DatabaseError(format!("Failed to open {}: {}", database_url, e))
            })?;

        info!("Connected to audit ledger database at {}", database_url);
        Ok(Database { pool })
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    pub async fn new_in_memory() -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Database { pool })
    }

    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::raw_sql(schema::AUDIT_LEDGER_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to apply schema: {}", e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for Database {
    async fn insert(&self, row: &LedgerRow) -> LedgerResult<()> {
        let record = LedgerRecord::from_row(row)?;
        let result = sqlx::query(
            r#"
            INSERT INTO audit_ledger
            (sequence_number, id, occurred_at, occurred_at_us, event_type, subject_id,
             session_id, payload, attributes, hash, previous_hash, signature, chained_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.sequence_number)
        .bind(record.id)
        .bind(&record.occurred_at)
        .bind(record.occurred_at_us)
        .bind(record.event_type)
        .bind(record.subject_id)
        .bind(record.session_id)
        .bind(record.payload)
        .bind(record.attributes)
        .bind(&record.hash)
        .bind(&record.previous_hash)
        .bind(record.signature)
        .bind(record.chained_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("audit_ledger.sequence_number") => {
                Err(LedgerError::DuplicateSequence(row.sequence_number()))
            }
            Err(e) => Err(LedgerError::DatabaseError(format!(
                "Failed to insert ledger row {}: {}",
                row.sequence_number(),
                e
            ))),
        }
    }

    async fn scan_ordered(&self, after: u64, limit: usize) -> LedgerResult<Vec<ScannedRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_ledger
            WHERE sequence_number > ?
            ORDER BY sequence_number ASC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(after).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to scan ledger: {}", e)))?;

        rows.iter().map(decode_ledger_row).collect()
    }

    async fn latest(&self) -> LedgerResult<Option<ScannedRow>> {
        let row = sqlx::query("SELECT * FROM audit_ledger ORDER BY sequence_number DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to read chain tip: {}", e)))?;

        row.as_ref().map(decode_ledger_row).transpose()
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<RowRef>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_number, hash FROM audit_ledger
            WHERE occurred_at_us < ?
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(cutoff.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to list expired rows: {}", e)))?;

        rows.iter()
            .map(|row| -> LedgerResult<RowRef> {
                Ok(RowRef {
                    sequence_number: from_sql_sequence(row.try_get("sequence_number")?)?,
                    hash: parse_digest(row, "hash").ok(),
                })
            })
            .collect()
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM audit_ledger WHERE occurred_at_us < ?")
            .bind(cutoff.timestamp_micros())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to count expired rows: {}", e)))?;

        from_sql_sequence(row.try_get("count")?)
    }

    async fn commit_sweep(&self, sweep: &SweepCommit) -> LedgerResult<u64> {
        // Dropping the transaction on any error rolls the sweep back
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to start sweep: {}", e)))?;

        let deleted = sqlx::query("DELETE FROM audit_ledger WHERE occurred_at_us < ?")
            .bind(sweep.cutoff.timestamp_micros())
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to delete expired rows: {}", e)))?
            .rows_affected();

        if let Some(checkpoint) = &sweep.checkpoint {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO ledger_checkpoints
                (sequence_number, hash, deleted_count, deleted_root, cutoff, created_at, signature)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(to_sql_sequence(checkpoint.sequence_number)?)
            .bind(checkpoint.hash.to_hex())
            .bind(to_sql_sequence(checkpoint.deleted_count)?)
            .bind(checkpoint.deleted_root.to_hex())
            .bind(format_timestamp(&checkpoint.cutoff))
            .bind(format_timestamp(&checkpoint.created_at))
            .bind(checkpoint.signature.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to store checkpoint: {}", e)))?;
        }

        sqlx::query(
            r#"
            INSERT INTO ledger_high_water (id, sequence_number, hash)
            VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                sequence_number = excluded.sequence_number,
                hash = excluded.hash
            WHERE excluded.sequence_number > ledger_high_water.sequence_number
            "#,
        )
        .bind(to_sql_sequence(sweep.high_water.last_sequence_number())?)
        .bind(sweep.high_water.last_hash().to_hex())
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to record high-water mark: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to commit sweep: {}", e)))?;

        Ok(deleted)
    }

    async fn stats(&self) -> LedgerResult<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count,
                   MIN(occurred_at_us) AS oldest,
                   MAX(occurred_at_us) AS newest
            FROM audit_ledger
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to read ledger stats: {}", e)))?;

        let oldest: Option<i64> = row.try_get("oldest")?;
        let newest: Option<i64> = row.try_get("newest")?;
        Ok(StoreStats {
            count: from_sql_sequence(row.try_get("count")?)?,
            oldest: oldest.map(timestamp_from_micros).transpose()?,
            newest: newest.map(timestamp_from_micros).transpose()?,
        })
    }

    async fn latest_checkpoint(&self) -> LedgerResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_checkpoints ORDER BY sequence_number DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to read checkpoint: {}", e)))?;

        row.as_ref().map(decode_checkpoint).transpose()
    }

    async fn high_water(&self) -> LedgerResult<Option<ChainState>> {
        let row = sqlx::query("SELECT sequence_number, hash FROM ledger_high_water WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                LedgerError::DatabaseError(format!("Failed to read high-water mark: {}", e))
            })?;

        row.as_ref().map(decode_high_water).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::ChainProof;
    use crate::audit::digest::{HashDigest, GENESIS_HASH};
    use crate::audit::event::{Event, EventType};
    use chrono::{Duration, SubsecRound};
    use serde_json::json;

    async fn database() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    fn row(sequence_number: u64, age_days: i64) -> LedgerRow {
        let event = Event::new(EventType::AllowDecision, &json!({"n": sequence_number, "b": [1, 2]}))
            .unwrap()
            .with_subject("user-1")
            .at(Utc::now() - Duration::days(age_days));
        LedgerRow {
            event,
            proof: ChainProof {
                hash: HashDigest::of(&sequence_number.to_be_bytes()),
                previous_hash: GENESIS_HASH,
                signature: Some("cd".repeat(32)),
                chained_at: 1_700_000_000_123,
                sequence_number,
            },
        }
    }

    #[tokio::test]
    async fn test_row_survives_storage_unchanged() {
        let db = database().await;
        let original = row(1, 0);
        db.insert(&original).await.unwrap();

        let stored = db.latest().await.unwrap().unwrap().unwrap();
        assert_eq!(stored, original);
        assert_eq!(stored.recompute_hash(), original.recompute_hash());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let db = database().await;
        db.insert(&row(1, 0)).await.unwrap();
        let err = db.insert(&row(1, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateSequence(1)));
    }

    #[tokio::test]
    async fn test_corrupt_column_is_unreadable() {
        let db = database().await;
        db.insert(&row(1, 0)).await.unwrap();
        db.insert(&row(2, 0)).await.unwrap();
        sqlx::query("UPDATE audit_ledger SET payload = '{not json' WHERE sequence_number = 1")
            .execute(db.pool())
            .await
            .unwrap();

        let scanned = db.scan_ordered(0, 10).await.unwrap();
        let unreadable = scanned[0].as_ref().unwrap_err();
        assert_eq!(unreadable.sequence_number, 1);
        assert_eq!(unreadable.hash, Some(HashDigest::of(&1u64.to_be_bytes())));
        assert!(scanned[1].is_ok());
    }

    fn sweep(cutoff: DateTime<Utc>, checkpoint: Option<Checkpoint>) -> SweepCommit {
        SweepCommit {
            cutoff,
            checkpoint,
            high_water: ChainState::at(HashDigest::of(b"tip"), 3),
        }
    }

    fn checkpoint(sequence_number: u64) -> Checkpoint {
        Checkpoint {
            sequence_number,
            hash: HashDigest::of(&sequence_number.to_be_bytes()),
            deleted_count: sequence_number,
            deleted_root: HashDigest::of(b"root"),
            cutoff: Utc::now().trunc_subsecs(6),
            created_at: Utc::now().trunc_subsecs(6),
            signature: Some("ef".repeat(32)),
        }
    }

    #[tokio::test]
    async fn test_retention_queries() {
        let db = database().await;
        db.insert(&row(1, 40)).await.unwrap();
        db.insert(&row(2, 20)).await.unwrap();
        db.insert(&row(3, 0)).await.unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        assert_eq!(db.count_older_than(cutoff).await.unwrap(), 1);
        let expired = db.older_than(cutoff).await.unwrap();
        assert_eq!(expired[0].sequence_number, 1);

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.count, 3);
        assert!(stats.oldest < stats.newest);

        assert_eq!(db.commit_sweep(&sweep(cutoff, None)).await.unwrap(), 1);
        assert_eq!(db.stats().await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_cutoff_is_strict() {
        let db = database().await;
        let cutoff = Utc::now().trunc_subsecs(6) - Duration::days(30);
        for (seq, offset) in [(1u64, -1i64), (2, 0), (3, 1)] {
            let mut early = row(seq, 0);
            early.event = early.event.at(cutoff + Duration::microseconds(offset));
            db.insert(&early).await.unwrap();
        }

        let expired = db.older_than(cutoff).await.unwrap();
        assert_eq!(
            expired.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(db.count_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(db.commit_sweep(&sweep(cutoff, None)).await.unwrap(), 1);

        let left: Vec<u64> = db
            .scan_ordered(0, 10)
            .await
            .unwrap()
            .iter()
            .map(crate::audit::chain::scanned_sequence)
            .collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_sweep_commit_round_trip() {
        let db = database().await;
        assert!(db.latest_checkpoint().await.unwrap().is_none());
        assert!(db.high_water().await.unwrap().is_none());

        let written = checkpoint(7);
        db.commit_sweep(&sweep(Utc::now(), Some(written.clone())))
            .await
            .unwrap();
        assert_eq!(db.latest_checkpoint().await.unwrap(), Some(written));

        let mark = db.high_water().await.unwrap().unwrap();
        assert_eq!(mark.last_sequence_number(), 3);
        assert_eq!(mark.last_hash(), HashDigest::of(b"tip"));

        // A later sweep with a lower tip leaves the mark alone
        let mut lower = sweep(Utc::now(), None);
        lower.high_water = ChainState::genesis();
        db.commit_sweep(&lower).await.unwrap();
        assert_eq!(db.high_water().await.unwrap(), Some(mark));
    }

    #[tokio::test]
    async fn test_failed_checkpoint_rolls_back_sweep() {
        let db = database().await;
        db.insert(&row(1, 40)).await.unwrap();
        db.insert(&row(2, 0)).await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_checkpoints BEFORE INSERT ON ledger_checkpoints
            BEGIN SELECT RAISE(ABORT, 'checkpoint storage offline'); END
            "#,
        )
        .execute(db.pool())
        .await
        .unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let err = db
            .commit_sweep(&sweep(cutoff, Some(checkpoint(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DatabaseError(_)));

        assert_eq!(db.stats().await.unwrap().count, 2);
        assert!(db.latest_checkpoint().await.unwrap().is_none());
        assert!(db.high_water().await.unwrap().is_none());
    }
}
