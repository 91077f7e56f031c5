//! # store::registry
//!
//! **Trade Registry** — durable mapping `trade key → TradeRecord`, the single
//! source of truth for "which trades exist".
//!
//! - `try_open` is atomic (SET NX): under concurrent open attempts for the
//!   same identity exactly one succeeds, the rest get [`RegistryError::AlreadyOpen`].
//! - `close` is idempotent — removing a missing entry is not an error.
//! - `reconstruct_all` rehydrates every persisted record on startup so the
//!   trackers resume with their **original** `created_at` (remaining timeout
//!   นับจากตอนเปิดจริง ไม่ใช่นับใหม่หลัง restart).

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::models::{TradeIdentity, TradeRecord};
use crate::models::trade::TRADE_KEY_PATTERN;

use super::{Store, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("trade already open: {0}")]
    AlreadyOpen(TradeIdentity),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("trade record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct TradeRegistry {
    store: Arc<dyn Store>,
}

impl TradeRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persists `record` under its identity key. Fails with `AlreadyOpen`
    /// when an entry already exists — the existence check and the write are
    /// a single atomic store operation.
    pub async fn try_open(&self, record: &TradeRecord) -> Result<(), RegistryError> {
        let identity = record.identity();
        let payload = serde_json::to_string(record)?;
        let inserted = self.store.set_nx(&identity.trade_key(), &payload).await?;
        if !inserted {
            return Err(RegistryError::AlreadyOpen(identity));
        }
        Ok(())
    }

    /// Removes the registry entry. Idempotent by design of the store `del`.
    pub async fn close(&self, identity: &TradeIdentity) -> Result<(), StoreError> {
        self.store.del(&identity.trade_key()).await
    }

    /// Scans every persisted trade entry and decodes it. Corrupt entries are
    /// skipped with a warning rather than failing the whole startup.
    pub async fn reconstruct_all(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let keys = self.store.scan(TRADE_KEY_PATTERN).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.store.mget(&keys).await?;
        let mut records = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(payload) = value else { continue };
            match serde_json::from_str::<TradeRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key, error = %e, "skipping undecodable trade record"),
            }
        }

        info!(count = records.len(), "trade registry reconstructed");
        Ok(records)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
