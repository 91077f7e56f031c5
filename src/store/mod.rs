//! # store
//!
//! The price/trade persistence substrate behind one seam: [`Store`].
//!
//! The trait mirrors the thin command surface the system actually needs —
//! durable key/value entries (trade registry), append-only time-ordered
//! samples (tick series) and key-pattern change notifications (the bus the
//! trackers subscribe to). [`redis::RedisStore`] is the production
//! implementation; `memory::MemoryStore` backs the lifecycle tests.
//!
//! Components receive `Arc<dyn Store>` explicitly — no module-level
//! connection singletons.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod redis;
pub mod registry;

#[cfg(test)]
pub mod memory;

pub use registry::{RegistryError, TradeRegistry};

// ─── Types ────────────────────────────────────────────────────────────────────

/// One change-notification event: `(channel, message)`.
///
/// Subscribers only need the *fact* that the key changed — they follow up
/// with a fresh [`Store::ts_latest`] read, never trust the message body.
pub type KeyEvent = (String, String);

/// Latest sample of a time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub timestamp: u64,
    pub value:     f64,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// A sample with this exact timestamp already exists for the key.
    /// Expected under redundant tick delivery — non-fatal (ดู ingest).
    #[error("duplicate sample timestamp for {key} at {timestamp}")]
    DuplicateTimestamp { key: String, timestamp: u64 },

    /// Transient I/O failure talking to the store.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ─── Store seam ───────────────────────────────────────────────────────────────

/// Command surface of the price store + registry substrate.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Key/value (registry entries, market metadata) ────────────────────────
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Idempotent delete — removing a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Atomic set-if-absent. Returns `false` when the key already existed.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    // ── Time series (tick samples) ───────────────────────────────────────────
    /// Append one sample. A write at an already-recorded timestamp fails
    /// with [`StoreError::DuplicateTimestamp`] instead of overwriting.
    async fn ts_add(&self, key: &str, timestamp: u64, value: f64) -> Result<(), StoreError>;
    /// Latest sample of the series, `None` when the series is empty or absent.
    async fn ts_latest(&self, key: &str) -> Result<Option<PriceSample>, StoreError>;

    // ── Change notifications ─────────────────────────────────────────────────
    /// Register for change events on `key`. Events arrive on the returned
    /// channel as `(channel, message)` pairs.
    async fn subscribe(&self, key: &str) -> Result<mpsc::UnboundedReceiver<KeyEvent>, StoreError>;
    /// Idempotent — unsubscribing twice (or without subscribing) is harmless.
    async fn unsubscribe(&self, key: &str) -> Result<(), StoreError>;
}
