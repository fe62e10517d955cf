//! Configuration loader for the audit ledger
//! Layers an optional TOML file under `LEDGER__`-prefixed environment variables

use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::AppConfig;
use crate::audit::signer::SigningKey;
use crate::error::{LedgerError, LedgerResult};

pub const DEFAULT_CONFIG_FILE: &str = "audit-ledger.toml";
const ENV_PREFIX: &str = "LEDGER";

impl AppConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    ///
    /// Environment variables use `__` between nested keys, e.g.
    /// `LEDGER__COMPLIANCE__RETENTION_DAYS=365`.
    pub fn load(path: Option<&Path>) -> LedgerResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        info!("Loading ledger configuration from: {:?}", path);

        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration before any I/O happens.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.compliance.retention_days < 0 {
            return Err(LedgerError::negative_retention(
                self.compliance.retention_days,
            ));
        }

        if self.scheduler.verify_batch_size == 0 {
            return Err(LedgerError::ConfigError(
                "scheduler.verify_batch_size must be greater than zero".to_string(),
            ));
        }

        if self.database_url.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "database_url must not be empty".to_string(),
            ));
        }

        if self.signing.key_hex.is_some() && self.signing.key_path.is_some() {
            return Err(LedgerError::ConfigError(
                "Configure either signing.key_hex or signing.key_path, not both".to_string(),
            ));
        }

        if let Some(key_hex) = &self.signing.key_hex {
            SigningKey::from_hex(key_hex)?;
        }

        if self.compliance.encryption_enabled {
            warn!("compliance.encryption_enabled is set but encryption at rest is not implemented");
        }

        Ok(())
    }

    /// Resolve the operator-provisioned signing key.
    ///
    /// Fails when signatures are required and no key is configured; a key is
    /// never generated on the fly.
    pub fn signing_key(&self) -> LedgerResult<Option<SigningKey>> {
        let key = match (&self.signing.key_hex, &self.signing.key_path) {
            (Some(key_hex), _) => Some(SigningKey::from_hex(key_hex)?),
            (None, Some(key_path)) => Some(SigningKey::from_file(Path::new(key_path))?),
            (None, None) => None,
        };

        if key.is_none() && self.compliance.signature_required {
            return Err(LedgerError::missing_signing_key());
        }

        Ok(key)
    }
}

/// Write a starter configuration file.
pub fn write_default_config(path: &Path) -> LedgerResult<()> {
    let contents = toml_template(&AppConfig::default());
    fs::write(path, contents).map_err(|e| {
        LedgerError::ConfigError(format!("Failed to write {:?}: {}", path, e))
    })
}

fn toml_template(config: &AppConfig) -> String {
    format!(
        "database_url = \"{}\"\n\n\
         [compliance]\n\
         retention_days = {}\n\
         signature_required = {}\n\
         verification_enabled = {}\n\
         encryption_enabled = {}\n\n\
         [signing]\n\
         # key_hex = \"<64+ hex chars>\"\n\
         # key_path = \"/etc/audit-ledger/signing.key\"\n\n\
         [export]\n\
         vendor = \"{}\"\n\
         product = \"{}\"\n\
         version = \"{}\"\n\n\
         [scheduler]\n\
         verify_interval_secs = {}\n\
         sweep_interval_secs = {}\n\
         verify_batch_size = {}\n\
         verify_timeout_secs = {}\n",
        config.database_url,
        config.compliance.retention_days,
        config.compliance.signature_required,
        config.compliance.verification_enabled,
        config.compliance.encryption_enabled,
        config.export.vendor,
        config.export.product,
        config.export.version,
        config.scheduler.verify_interval_secs,
        config.scheduler.sweep_interval_secs,
        config.scheduler.verify_batch_size,
        config.scheduler.verify_timeout_secs,
    )
}
