use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError(format!("Migration error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Ledger bootstrap failed: {0}")]
    BootstrapError(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Sequence number {0} already exists in the ledger")]
    DuplicateSequence(u64),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn negative_retention(days: i64) -> Self {
        Self::PolicyViolation(format!(
            "Retention window must not be negative (got {} days)",
            days
        ))
    }

    pub fn missing_signing_key() -> Self {
        Self::ConfigError(
            "signature_required is enabled but no signing key is configured".to_string(),
        )
    }
}
