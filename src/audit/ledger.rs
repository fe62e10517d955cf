//! Audit Ledger
//!
//! One handle over a store that appends, verifies, sweeps and exports.
//! Share it as `Arc<AuditLedger>`; appends from any number of tasks are
//! serialized by the writer.

use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::chain::{ChainState, LedgerRow};
use crate::audit::event::Event;
use crate::audit::export::{ExportFormat, ExportFormatter, ExportQuery};
use crate::audit::retention::{RetentionManager, RetentionReport};
use crate::audit::signer::LedgerSigner;
use crate::audit::store::LedgerStore;
use crate::audit::verify::{IntegrityVerifier, VerificationReport, VerifyOptions, DEFAULT_BATCH_SIZE};
use crate::audit::writer::LedgerWriter;
use crate::config::{ComplianceSettings, ExportSettings};
use crate::error::LedgerResult;

pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    writer: LedgerWriter,
    verifier: IntegrityVerifier,
    retention: RetentionManager,
    exporter: ExportFormatter,
    settings: ComplianceSettings,
}

impl AuditLedger {
    /// Open the ledger, rebuilding the chain tip from `store`.
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        settings: ComplianceSettings,
        signer: Option<LedgerSigner>,
        export_settings: ExportSettings,
    ) -> LedgerResult<Self> {
        let writer = LedgerWriter::open(store.clone(), &settings, signer.clone()).await?;
        let verifier =
            IntegrityVerifier::new(store.clone(), signer.clone(), settings.signature_required);
        let retention = RetentionManager::new(store.clone(), signer, settings.retention_days);

        Ok(Self {
            store,
            writer,
            verifier,
            retention,
            exporter: ExportFormatter::new(export_settings),
            settings,
        })
    }

    pub fn settings(&self) -> &ComplianceSettings {
        &self.settings
    }

    pub async fn append(&self, event: Event) -> LedgerResult<LedgerRow> {
        self.writer.append(event).await
    }

    pub async fn head(&self) -> ChainState {
        self.writer.head().await
    }

    /// Verify the whole ledger up to the current chain tip.
    pub async fn verify(&self) -> VerificationReport {
        self.verify_with(VerifyOptions::default()).await
    }

    /// Verify with explicit bounds. Unless the caller set one, the writer's
    /// current tip is used as the expected head so a deleted tail is caught.
    pub async fn verify_with(&self, mut options: VerifyOptions) -> VerificationReport {
        if options.expected_head.is_none() {
            let head = self.writer.head().await;
            options.expected_head = Some(head.last_sequence_number());
        }
        self.verifier.verify_with(options).await
    }

    pub async fn sweep(&self) -> LedgerResult<RetentionReport> {
        self.retention.sweep(&self.writer).await
    }

    /// Rows the next sweep would delete.
    pub async fn pending_sweep(&self) -> LedgerResult<u64> {
        self.retention.pending().await
    }

    pub async fn sweep_with_window(&self, retention_days: i64) -> LedgerResult<RetentionReport> {
        self.retention
            .sweep_with_window(&self.writer, retention_days)
            .await
    }

    /// Rows matching `query`, ascending by sequence number. Unreadable rows
    /// are skipped with a warning.
    pub async fn rows(&self, query: &ExportQuery) -> LedgerResult<Vec<LedgerRow>> {
        let mut rows = Vec::new();
        let mut after = query.from_sequence.unwrap_or(1).saturating_sub(1);

        loop {
            let page = self.store.scan_ordered(after, DEFAULT_BATCH_SIZE).await?;
            let page_len = page.len();

            for scanned in page {
                match scanned {
                    Ok(row) => {
                        after = row.sequence_number();
                        if query.matches(&row) {
                            rows.push(row);
                        }
                    }
                    Err(unreadable) => {
                        after = unreadable.sequence_number;
                        warn!(
                            "Skipping unreadable row {} in export: {}",
                            unreadable.sequence_number, unreadable.reason
                        );
                    }
                }
            }

            let past_upper = query.upper_sequence().map_or(false, |to| after >= to);
            if page_len < DEFAULT_BATCH_SIZE || past_upper {
                break;
            }
        }

        Ok(rows)
    }

    pub async fn export(&self, format: ExportFormat, query: &ExportQuery) -> LedgerResult<String> {
        let rows = self.rows(query).await?;
        let output = self.exporter.export(&rows, format)?;
        info!("Exported {} ledger rows as {}", rows.len(), format);
        Ok(output)
    }
}
