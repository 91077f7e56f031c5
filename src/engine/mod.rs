//! Core engines: per-trade lifecycle tracking and streaming tick ingest.

pub mod ingest;
pub mod tracker;

pub use ingest::IngestAdapter;
pub use tracker::{evaluate_triggers, OnTradeClose, TradeHandle, TradeTracker};
