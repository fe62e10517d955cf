// Database schema for the audit ledger

pub const AUDIT_LEDGER_SCHEMA: &str = include_str!("../../migrations/001_audit_ledger.sql");
