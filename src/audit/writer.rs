//! Ledger Writer
//!
//! Appends events one at a time. The chain tip lives behind a single mutex
//! that is held from reading the previous hash until the new row is
//! persisted, so concurrent appends are serialized.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::audit::chain::{ChainProof, ChainState, LedgerRow};
use crate::audit::event::Event;
use crate::audit::hasher;
use crate::audit::signer::LedgerSigner;
use crate::audit::store::LedgerStore;
use crate::config::ComplianceSettings;
use crate::error::{LedgerError, LedgerResult};

pub struct LedgerWriter {
    store: Arc<dyn LedgerStore>,
    chain: Mutex<ChainState>,
    signer: Option<LedgerSigner>,
    signature_required: bool,
}

impl LedgerWriter {
    /// Open a writer over `store`, seeding the chain tip from the newest row
    /// or from what retention sweeps recorded, whichever is further along.
    ///
    /// Fails if signatures are required without a signer, or if the tip
    /// cannot be read. An unreadable store never falls back to genesis.
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        settings: &ComplianceSettings,
        signer: Option<LedgerSigner>,
    ) -> LedgerResult<Self> {
        if settings.signature_required && signer.is_none() {
            return Err(LedgerError::missing_signing_key());
        }

        let state = bootstrap(store.as_ref()).await?;
        info!(
            "Ledger writer ready at sequence {} (head {})",
            state.last_sequence_number(),
            state.last_hash().short(16)
        );

        Ok(Self {
            store,
            chain: Mutex::new(state),
            signer,
            signature_required: settings.signature_required,
        })
    }

    /// Chain, sign and persist one event.
    ///
    /// The chain tip only advances after the store accepts the row; any
    /// failure is returned to the caller and leaves the tip untouched.
    pub async fn append(&self, event: Event) -> LedgerResult<LedgerRow> {
        let mut chain = self.chain.lock().await;

        let sequence_number = chain.next_sequence_number();
        let previous_hash = chain.last_hash();
        let content_hash = hasher::content_hash(&event);
        let hash = hasher::chain_hash(&previous_hash, &content_hash, sequence_number);

        let signature = match (&self.signer, self.signature_required) {
            (Some(signer), true) => Some(signer.sign_digest(&hash)?),
            _ => None,
        };

        let row = LedgerRow {
            event,
            proof: ChainProof {
                hash,
                previous_hash,
                signature,
                chained_at: Utc::now().timestamp_millis(),
                sequence_number,
            },
        };

        if let Err(e) = self.store.insert(&row).await {
            error!(
                "Failed to persist audit event {} at sequence {}: {}",
                row.id(),
                sequence_number,
                e
            );
            return Err(e);
        }

        chain.advance(hash, sequence_number);
        debug!(
            "Appended {} at sequence {} ({})",
            row.event.summary(),
            sequence_number,
            hash.short(16)
        );

        Ok(row)
    }

    /// Copy of the current chain tip.
    pub async fn head(&self) -> ChainState {
        *self.chain.lock().await
    }

    /// Hold the writer lock, blocking appends until the guard is dropped.
    pub(crate) async fn exclusive(&self) -> MutexGuard<'_, ChainState> {
        self.chain.lock().await
    }
}

/// Rebuild the chain tip from the store.
async fn bootstrap(store: &dyn LedgerStore) -> LedgerResult<ChainState> {
    let latest = store
        .latest()
        .await
        .map_err(|e| LedgerError::BootstrapError(format!("Failed to read chain tip: {}", e)))?;

    let checkpoint = store.latest_checkpoint().await.map_err(|e| {
        LedgerError::BootstrapError(format!("Failed to read retention checkpoint: {}", e))
    })?;

    let high_water = store.high_water().await.map_err(|e| {
        LedgerError::BootstrapError(format!("Failed to read retention high-water mark: {}", e))
    })?;

    let from_rows = match latest {
        Some(Ok(row)) => Some(ChainState::at(row.proof.hash, row.sequence_number())),
        Some(Err(unreadable)) => match unreadable.hash {
            Some(hash) => {
                warn!(
                    "Newest row {} is unreadable ({}); seeding from its stored hash",
                    unreadable.sequence_number, unreadable.reason
                );
                Some(ChainState::at(hash, unreadable.sequence_number))
            }
            None => {
                return Err(LedgerError::BootstrapError(format!(
                    "Newest row {} is unreadable: {}",
                    unreadable.sequence_number, unreadable.reason
                )));
            }
        },
        None => None,
    };

    let from_checkpoint = checkpoint.map(|cp| cp.anchor());

    // Sequence numbers a sweep deleted are never reused. On ties the
    // surviving row wins.
    let state = [high_water, from_checkpoint, from_rows]
        .into_iter()
        .flatten()
        .max_by_key(ChainState::last_sequence_number)
        .unwrap_or_else(ChainState::genesis);

    let behind_rows = from_rows.map_or(true, |rows| {
        rows.last_sequence_number() < state.last_sequence_number()
    });
    if !state.is_genesis() && behind_rows {
        info!(
            "Newest rows were removed by retention; continuing from sequence {}",
            state.last_sequence_number()
        );
    }

    Ok(state)
}
