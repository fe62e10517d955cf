#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use llm_audit_ledger::audit::{
    AuditLedger, Event, EventType, LedgerSigner, MemoryStore, SigningKey,
};
use llm_audit_ledger::config::{ComplianceSettings, ExportSettings};
use llm_audit_ledger::database::Database;

/// Fixed 32-byte test key, hex encoded
pub const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub fn test_signer() -> LedgerSigner {
    LedgerSigner::new(SigningKey::from_hex(TEST_KEY_HEX).expect("valid test key"))
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    let db = Database::new_in_memory()
        .await
        .expect("Failed to create test database");
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

pub fn compliance(retention_days: i64) -> ComplianceSettings {
    ComplianceSettings {
        retention_days,
        ..ComplianceSettings::default()
    }
}

pub async fn open_ledger(store: Arc<dyn llm_audit_ledger::audit::LedgerStore>) -> AuditLedger {
    AuditLedger::open(
        store,
        compliance(30),
        Some(test_signer()),
        ExportSettings::default(),
    )
    .await
    .expect("Failed to open ledger")
}

pub async fn sqlite_ledger() -> (Database, AuditLedger) {
    let db = setup_test_db().await;
    let ledger = open_ledger(Arc::new(db.clone())).await;
    (db, ledger)
}

pub async fn memory_ledger() -> (Arc<MemoryStore>, AuditLedger) {
    let store = Arc::new(MemoryStore::new());
    let ledger = open_ledger(store.clone()).await;
    (store, ledger)
}

pub fn scan_event(n: usize) -> Event {
    Event::new(
        EventType::PromptScan,
        &json!({"prompt_id": format!("p-{}", n), "riskScore": (n * 7) % 100}),
    )
    .expect("valid payload")
    .with_subject(format!("user-{}", n % 3))
    .with_session("session-1")
}

pub fn aged_event(days_ago: i64) -> Event {
    Event::new(EventType::DatasetEdit, &json!({"days_ago": days_ago}))
        .expect("valid payload")
        .at(Utc::now() - Duration::days(days_ago))
}

pub fn fixed_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T09:30:00.250000Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub async fn append_many(ledger: &AuditLedger, count: usize) {
    for n in 0..count {
        ledger.append(scan_event(n)).await.expect("append failed");
    }
}
