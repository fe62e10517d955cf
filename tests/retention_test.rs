//! Retention and restart tests against a SQLite ledger

use std::sync::Arc;

use llm_audit_ledger::audit::{AuditLedger, ExportQuery, LedgerStore, VerificationStatus};
use llm_audit_ledger::config::ExportSettings;
use llm_audit_ledger::database::Database;
use llm_audit_ledger::LedgerError;

mod common;
use common::*;

#[tokio::test]
async fn test_sweep_deletes_rows_past_cutoff() {
    let (db, ledger) = sqlite_ledger().await;
    for days_ago in [400, 90, 31, 29, 1, 0] {
        ledger.append(aged_event(days_ago)).await.unwrap();
    }

    let report = ledger.sweep().await.unwrap();
    assert_eq!(report.retention_days, 30);
    assert_eq!(report.total_entries, 6);
    assert_eq!(report.eligible_count, 3);
    assert_eq!(report.deleted_count, 3);
    assert_eq!(report.checkpoint_sequence, Some(3));

    let remaining = ledger.rows(&ExportQuery::default()).await.unwrap();
    let sequences: Vec<u64> = remaining.iter().map(|r| r.sequence_number()).collect();
    assert_eq!(sequences, vec![4, 5, 6]);
    assert!(remaining.iter().all(|r| r.occurred_at() >= report.cutoff));

    let checkpoint = db.latest_checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence_number, 3);
    assert_eq!(checkpoint.deleted_count, 3);
    assert!(checkpoint.signature.is_some());
}

#[tokio::test]
async fn test_chain_verifies_after_sweep() {
    let (_db, ledger) = sqlite_ledger().await;
    for days_ago in [60, 45, 10, 0] {
        ledger.append(aged_event(days_ago)).await.unwrap();
    }
    ledger.sweep().await.unwrap();
    append_many(&ledger, 2).await;

    let report = ledger.verify().await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert_eq!(report.anchor_sequence, 2);
    assert_eq!(report.verified_entries, 4);
    assert_eq!(report.last_verified_sequence, 6);
}

#[tokio::test]
async fn test_explicit_window_and_negative_window() {
    let (_db, ledger) = sqlite_ledger().await;
    for days_ago in [10, 5, 0] {
        ledger.append(aged_event(days_ago)).await.unwrap();
    }

    let err = ledger.sweep_with_window(-1).await.unwrap_err();
    assert!(matches!(err, LedgerError::PolicyViolation(_)));
    assert_eq!(ledger.rows(&ExportQuery::default()).await.unwrap().len(), 3);

    let report = ledger.sweep_with_window(7).await.unwrap();
    assert_eq!(report.deleted_count, 1);
}

#[tokio::test]
async fn test_ledger_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    let last_hash = {
        let db = Database::new(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        let ledger = open_ledger(Arc::new(db)).await;
        append_many(&ledger, 3).await;
        ledger.head().await.last_hash()
    };

    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    let ledger = open_ledger(Arc::new(db)).await;
    let head = ledger.head().await;
    assert_eq!(head.last_sequence_number(), 3);
    assert_eq!(head.last_hash(), last_hash);

    let row = ledger.append(scan_event(9)).await.unwrap();
    assert_eq!(row.sequence_number(), 4);
    assert_eq!(row.proof.previous_hash, last_hash);
    assert!(ledger.verify().await.is_valid);
}

#[tokio::test]
async fn test_reopen_after_full_sweep_continues_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    {
        let db = Database::new(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        let ledger = open_ledger(Arc::new(db)).await;
        for days_ago in [90, 60] {
            ledger.append(aged_event(days_ago)).await.unwrap();
        }
        let report = ledger.sweep().await.unwrap();
        assert_eq!(report.deleted_count, 2);
    }

    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    let ledger = open_ledger(Arc::new(db)).await;
    assert_eq!(ledger.head().await.last_sequence_number(), 2);

    let row = ledger.append(scan_event(1)).await.unwrap();
    assert_eq!(row.sequence_number(), 3);
    assert!(ledger.verify().await.is_valid);
}

#[tokio::test]
async fn test_swept_tip_sequence_is_never_reused() {
    let (store, ledger) = memory_ledger().await;
    ledger.append(aged_event(0)).await.unwrap();
    let old_tip = ledger.append(aged_event(90)).await.unwrap();

    let report = ledger.sweep().await.unwrap();
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.checkpoint_sequence, None);
    drop(ledger);

    let ledger = open_ledger(store.clone()).await;
    assert_eq!(ledger.head().await.last_sequence_number(), 2);
    let before = ledger.verify().await;
    assert_eq!(before.status, VerificationStatus::TamperDetected);
    assert_eq!(before.missing_sequence_gaps, vec![2]);

    let row = ledger.append(scan_event(1)).await.unwrap();
    assert_eq!(row.sequence_number(), 3);
    assert_eq!(row.proof.previous_hash, old_tip.proof.hash);

    let after = ledger.verify().await;
    assert_eq!(after.status, VerificationStatus::TamperDetected);
    assert_eq!(after.missing_sequence_gaps, vec![2]);
}

#[tokio::test]
async fn test_swept_tip_survives_file_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    {
        let db = Database::new(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        let ledger = open_ledger(Arc::new(db)).await;
        for days_ago in [0, 1, 90] {
            ledger.append(aged_event(days_ago)).await.unwrap();
        }
        assert_eq!(ledger.sweep().await.unwrap().deleted_count, 1);
    }

    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    let ledger = open_ledger(Arc::new(db)).await;
    let row = ledger.append(scan_event(4)).await.unwrap();
    assert_eq!(row.sequence_number(), 4);
}

#[tokio::test]
async fn test_failed_checkpoint_write_deletes_nothing() {
    let (db, ledger) = sqlite_ledger().await;
    for days_ago in [60, 45, 0] {
        ledger.append(aged_event(days_ago)).await.unwrap();
    }
    sqlx::query(
        r#"
        CREATE TRIGGER reject_checkpoints BEFORE INSERT ON ledger_checkpoints
        BEGIN SELECT RAISE(ABORT, 'checkpoint storage offline'); END
        "#,
    )
    .execute(db.pool())
    .await
    .unwrap();

    assert!(ledger.sweep().await.is_err());
    assert_eq!(ledger.rows(&ExportQuery::default()).await.unwrap().len(), 3);
    assert!(db.latest_checkpoint().await.unwrap().is_none());
    assert!(ledger.verify().await.is_valid);

    sqlx::query("DROP TRIGGER reject_checkpoints")
        .execute(db.pool())
        .await
        .unwrap();
    let report = ledger.sweep().await.unwrap();
    assert_eq!(report.deleted_count, 2);
    assert_eq!(report.checkpoint_sequence, Some(2));
    assert!(ledger.verify().await.is_valid);
}

#[tokio::test]
async fn test_startup_requires_signing_key() {
    let db = setup_test_db().await;
    let result = AuditLedger::open(
        Arc::new(db),
        compliance(30),
        None,
        ExportSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(LedgerError::ConfigError(_))));
}
