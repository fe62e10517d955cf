//! Ledger Configuration
//!
//! Settings consumed by the writer, verifier, retention manager and
//! exporter, plus the operator-facing groups used by the binary.

pub mod loader;

use serde::{Deserialize, Serialize};

pub use loader::DEFAULT_CONFIG_FILE;

/// Compliance settings shared by every ledger component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceSettings {
    /// Age in days after which rows become eligible for a retention sweep.
    pub retention_days: i64,
    /// Sign every chain hash with the operator's HMAC key.
    pub signature_required: bool,
    pub verification_enabled: bool,
    /// Carried for compatibility; encryption at rest is not implemented.
    pub encryption_enabled: bool,
}

impl Default for ComplianceSettings {
    fn default() -> Self {
        Self {
            retention_days: 2555,
            signature_required: true,
            verification_enabled: true,
            encryption_enabled: true,
        }
    }
}

/// Where the HMAC signing key comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    pub key_hex: Option<String>,
    pub key_path: Option<String>,
}

/// CEF header identity for SIEM exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub vendor: String,
    pub product: String,
    pub version: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            vendor: "LLMGuard".to_string(),
            product: "AuditLedger".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub verify_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub verify_batch_size: usize,
    /// Upper bound on a single verification pass; 0 disables the deadline.
    pub verify_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            verify_interval_secs: 3600,
            sweep_interval_secs: 86400,
            verify_batch_size: 500,
            verify_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub compliance: ComplianceSettings,
    pub signing: SigningSettings,
    pub export: ExportSettings,
    pub scheduler: SchedulerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db".to_string(),
            compliance: ComplianceSettings::default(),
            signing: SigningSettings::default(),
            export: ExportSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}
