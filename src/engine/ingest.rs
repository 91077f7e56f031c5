//! # engine::ingest
//!
//! **Streaming Ingest Adapter** — normalizes chart ticks off the provider
//! feed and appends them to the price store.
//!
//! ## กติกาต่อ tick
//! มี `UTM` + metric ไหน → เขียน sample ของ metric นั้น (BID / OFR / LTV)
//! ขาด `UTM` หรือขาด metric → ข้าม metric นั้นเงียบๆ (partial update ปกติ)
//! `TTV` (incremental volume) → log อย่างเดียว ไม่เก็บ
//!
//! Writes are fire-and-forget: duplicate-timestamp rejection from the store
//! means the same tick was delivered twice — warn and move on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::trade::{metric_key, BID, LTV, OFR};
use crate::models::ChartTick;
use crate::store::{Store, StoreError};

pub struct IngestAdapter {
    store:      Arc<dyn Store>,
    tick_count: Arc<AtomicU64>,
}

impl IngestAdapter {
    pub fn new(store: Arc<dyn Store>, tick_count: Arc<AtomicU64>) -> Self {
        Self { store, tick_count }
    }

    /// Processes one inbound tick frame.
    pub async fn ingest(&self, tick: &ChartTick) {
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let epic = tick.epic();
        let Some(timestamp) = tick.update_time() else {
            debug!(%epic, "tick without update time — skipped");
            return;
        };

        let metrics = [
            (BID, tick.bid_price()),
            (OFR, tick.offer_price()),
            (LTV, tick.last_traded_volume()),
        ];

        for (metric, value) in metrics {
            let Some(value) = value else { continue };
            self.write_sample(&metric_key(&epic, metric), timestamp, value).await;
        }

        if tick.ttv.as_deref().is_some_and(|v| !v.is_empty()) {
            debug!(%epic, ttv = ?tick.ttv, "incremental traded volume tick");
        }
    }

    async fn write_sample(&self, key: &str, timestamp: u64, value: f64) {
        match self.store.ts_add(key, timestamp, value).await {
            Ok(()) => {}
            Err(StoreError::DuplicateTimestamp { .. }) => {
                // Tick เดิมถูกส่งซ้ำ — ไม่ใช่ปัญหา correctness
                warn!(key, timestamp, "duplicate sample timestamp — ignored");
            }
            Err(e) => {
                warn!(key, timestamp, error = %e, "sample write failed");
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn make_adapter(store: &Arc<MemoryStore>) -> IngestAdapter {
        IngestAdapter::new(store.clone() as Arc<dyn Store>, Arc::new(AtomicU64::new(0)))
    }

    fn make_tick(utm: Option<&str>, bid: Option<&str>, ofr: Option<&str>) -> ChartTick {
        ChartTick {
            item: "CHART:CS.D.GBPJPY.CFD.IP:TICK".into(),
            utm:  utm.map(String::from),
            bid:  bid.map(String::from),
            ofr:  ofr.map(String::from),
            ltv:  None,
            ttv:  None,
        }
    }

    #[tokio::test]
    async fn test_writes_one_sample_per_present_metric() {
        let store = MemoryStore::new_shared();
        let adapter = make_adapter(&store);

        adapter.ingest(&make_tick(Some("1000"), Some("185.5"), None)).await;

        let bid = store.ts_latest("CS.D.GBPJPY.CFD.IP:BID:TICK").await.unwrap();
        let ofr = store.ts_latest("CS.D.GBPJPY.CFD.IP:OFR:TICK").await.unwrap();
        assert_eq!(bid.map(|s| s.value), Some(185.5));
        assert_eq!(ofr, None);
    }

    #[tokio::test]
    async fn test_tick_without_timestamp_is_skipped() {
        let store = MemoryStore::new_shared();
        let adapter = make_adapter(&store);

        adapter.ingest(&make_tick(None, Some("185.5"), Some("185.7"))).await;

        assert_eq!(store.ts_latest("CS.D.GBPJPY.CFD.IP:BID:TICK").await.unwrap(), None);
        assert_eq!(store.ts_latest("CS.D.GBPJPY.CFD.IP:OFR:TICK").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_timestamp_is_swallowed() {
        let store = MemoryStore::new_shared();
        let adapter = make_adapter(&store);

        // ส่ง tick เดียวกันสองรอบ (redundant delivery) — ห้าม panic/error
        let tick = make_tick(Some("1000"), Some("185.5"), Some("185.7"));
        adapter.ingest(&tick).await;
        adapter.ingest(&tick).await;

        let bid = store.ts_latest("CS.D.GBPJPY.CFD.IP:BID:TICK").await.unwrap();
        assert_eq!(bid.map(|s| s.value), Some(185.5));
    }
}
