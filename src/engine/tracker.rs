//! # engine::tracker
//!
//! **Trade Lifecycle Controller** — หนึ่ง instance ต่อหนึ่ง open trade
//!
//! ## State machine
//! ```text
//! CREATED ──(persist + subscribe + arm timeout)──▶ MONITORING
//!    │                                                │
//!    │ timeout หมดตั้งแต่เปิด                           │ notification / timeout /
//!    │ (no-op open/close)                              │ explicit close
//!    ▼                                                ▼
//! CLOSING ──(registry DEL + unsubscribe + callback)──▶ CLOSED
//! ```
//!
//! การปิดต้องเกิด **ครั้งเดียว ด้วยเหตุผลเดียว** — timeout timer กับ price
//! trigger วิ่งแข่งกันได้เสมอ ตัวที่มาก่อนชนะผ่าน compare-exchange บน status
//! cell ตัวที่มาทีหลังเห็น CLOSING/CLOSED แล้วเงียบไป

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::models::{CloseReason, Direction, TradeIdentity, TradeRecord, TradeStatus};
use crate::store::{KeyEvent, RegistryError, Store, TradeRegistry};

/// Callback แจ้ง owning process ว่า trade นี้ไม่ active แล้ว
/// (ใช้ถอด handle ออกจาก active-trade map)
pub type OnTradeClose = Arc<dyn Fn() + Send + Sync>;

// ─── Trigger evaluation ───────────────────────────────────────────────────────

/// Evaluates the trigger table for one observed price.
///
/// - BUY:  take-profit when `price >= take_profit`, stop-loss when `price <= stop_loss`
/// - SELL: take-profit when `price <= take_profit`, stop-loss when `price >= stop_loss`
///
/// When stop and target are inverted so both fire at once, take-profit wins.
pub fn evaluate_triggers(
    direction: Direction,
    stop_loss: f64,
    take_profit: f64,
    price: f64,
) -> Option<CloseReason> {
    let hit_take_profit = match direction {
        Direction::Buy  => price >= take_profit,
        Direction::Sell => price <= take_profit,
    };
    let hit_stop_loss = match direction {
        Direction::Buy  => price <= stop_loss,
        Direction::Sell => price >= stop_loss,
    };

    if hit_take_profit {
        Some(CloseReason::TakeProfit)
    } else if hit_stop_loss {
        Some(CloseReason::StopLoss)
    } else {
        None
    }
}

// ─── TradeHandle ──────────────────────────────────────────────────────────────

/// Owning-process view of a running tracker. Cheap to clone; all mutation of
/// the trade itself stays inside the tracker task.
#[derive(Clone, Debug)]
pub struct TradeHandle {
    pub record:   TradeRecord,
    status:       Arc<AtomicU8>,
    close_reason: Arc<OnceLock<CloseReason>>,
    latest_price: Arc<RwLock<Option<f64>>>,
    close_tx:     mpsc::UnboundedSender<CloseReason>,
}

impl TradeHandle {
    pub fn status(&self) -> TradeStatus {
        TradeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.status() == TradeStatus::Closed
    }

    /// The single recorded close reason, once the trade has closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub async fn latest_price(&self) -> Option<f64> {
        *self.latest_price.read().await
    }

    /// Requests a close through the controller's own close path. A request
    /// against an already-finished trade is a no-op.
    pub fn request_close(&self, reason: CloseReason) {
        if self.close_tx.send(reason).is_err() {
            debug!(trade = %self.record.identity(), "close requested on finished trade — ignored");
        }
    }
}

// ─── Tracker ──────────────────────────────────────────────────────────────────

pub struct TradeTracker;

struct TrackerInner {
    record:       TradeRecord,
    identity:     TradeIdentity,
    tick_key:     String,
    status:       Arc<AtomicU8>,
    close_reason: Arc<OnceLock<CloseReason>>,
    latest_price: Arc<RwLock<Option<f64>>>,
    store:        Arc<dyn Store>,
    registry:     TradeRegistry,
    on_close:     OnTradeClose,
}

impl TradeTracker {
    /// Opens a brand-new trade: persists it in the registry (atomic — a
    /// second open for the same identity gets `AlreadyOpen`), subscribes to
    /// its price key and arms the timeout.
    pub async fn open(
        store: Arc<dyn Store>,
        registry: TradeRegistry,
        record: TradeRecord,
        on_close: OnTradeClose,
    ) -> Result<TradeHandle, RegistryError> {
        Self::launch(store, registry, record, on_close, true).await
    }

    /// Rehydrates a trade from its persisted record on startup. The original
    /// `created_at` is preserved, so the remaining timeout is whatever is
    /// left of the original window — not a fresh one.
    pub async fn resume(
        store: Arc<dyn Store>,
        registry: TradeRegistry,
        record: TradeRecord,
        on_close: OnTradeClose,
    ) -> Result<TradeHandle, RegistryError> {
        Self::launch(store, registry, record, on_close, false).await
    }

    async fn launch(
        store: Arc<dyn Store>,
        registry: TradeRegistry,
        record: TradeRecord,
        on_close: OnTradeClose,
        persist: bool,
    ) -> Result<TradeHandle, RegistryError> {
        let identity = record.identity();
        let tick_key = identity.tick_key();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TrackerInner {
            record:       record.clone(),
            identity:     identity.clone(),
            tick_key:     tick_key.clone(),
            status:       Arc::new(AtomicU8::new(TradeStatus::Created as u8)),
            close_reason: Arc::new(OnceLock::new()),
            latest_price: Arc::new(RwLock::new(None)),
            store,
            registry,
            on_close,
        });

        let handle = TradeHandle {
            record,
            status:       inner.status.clone(),
            close_reason: inner.close_reason.clone(),
            latest_price: inner.latest_price.clone(),
            close_tx,
        };

        // ── Immediate-timeout shortcut: CREATED → CLOSING ────────────────────
        // หมดเวลาตั้งแต่ยังไม่เปิด (เช่น resume หลัง restart ที่นานเกิน window)
        // → ปิดเลย ไม่ persist ไม่ subscribe
        let deadline = inner.record.close_deadline();
        if Utc::now() >= deadline {
            info!(
                trade = %inner.identity,
                deadline = %deadline,
                "⏰ timeout already elapsed at open — closing immediately"
            );
            inner.close(CloseReason::Timeout).await;
            return Ok(handle);
        }

        if persist {
            inner.registry.try_open(&inner.record).await?;
        }

        let feed = match inner.store.subscribe(&tick_key).await {
            Ok(rx) => rx,
            Err(e) => {
                // Subscribe ไม่ได้ = monitor ไม่ได้ — ถอน entry ที่เพิ่งเขียน
                // แล้วรายงาน conflict-free error กลับไปให้ caller
                if persist {
                    let _ = inner.registry.close(&inner.identity).await;
                }
                return Err(RegistryError::Store(e));
            }
        };

        // Seed latest observed price — best effort, trigger ยังไม่ประเมิน
        let mut seeded = None;
        if let Ok(Some(sample)) = inner.store.ts_latest(&tick_key).await {
            seeded = Some(sample.value);
            *inner.latest_price.write().await = seeded;
        }

        inner.status.store(TradeStatus::Monitoring as u8, Ordering::Release);
        info!(
            trade       = %inner.identity,
            trade_id    = %inner.record.trade_id,
            take_profit = inner.record.take_profit,
            stop_loss   = inner.record.stop_loss,
            created_at  = %inner.record.created_at,
            deadline    = %deadline,
            latest      = ?seeded,
            "trade OPEN — monitoring"
        );

        tokio::spawn(run(inner, feed, close_rx));
        Ok(handle)
    }
}

// ─── Monitor loop ─────────────────────────────────────────────────────────────

async fn run(
    inner: Arc<TrackerInner>,
    mut feed: mpsc::UnboundedReceiver<KeyEvent>,
    mut close_rx: mpsc::UnboundedReceiver<CloseReason>,
) {
    let remaining = (inner.record.close_deadline() - Utc::now())
        .to_std()
        .unwrap_or_default();
    let deadline = Instant::now() + remaining;

    loop {
        tokio::select! {
            // ── Armed timeout ─────────────────────────────────────────────────
            _ = sleep_until(deadline) => {
                inner.close(CloseReason::Timeout).await;
                break;
            }

            // ── Price-change notification ─────────────────────────────────────
            Some((channel, _message)) = feed.recv() => {
                debug!(trade = %inner.identity, %channel, "price key changed");
                if inner.evaluate_latest().await {
                    break;
                }
            }

            // ── Explicit close request (routed through this path only) ────────
            Some(reason) = close_rx.recv() => {
                inner.close(reason).await;
                break;
            }
        }
    }
}

impl TrackerInner {
    /// Reads the current latest price and evaluates the trigger table.
    /// Returns `true` when this call closed the trade.
    async fn evaluate_latest(&self) -> bool {
        let sample = match self.store.ts_latest(&self.tick_key).await {
            Ok(Some(sample)) => sample,
            Ok(None) => return false,
            Err(e) => {
                // Transient read failure — ปล่อยผ่าน รอ notification ถัดไป
                warn!(trade = %self.identity, error = %e, "latest price read failed");
                return false;
            }
        };

        *self.latest_price.write().await = Some(sample.value);

        let Some(reason) = evaluate_triggers(
            self.record.direction,
            self.record.stop_loss,
            self.record.take_profit,
            sample.value,
        ) else {
            return false;
        };

        info!(
            trade  = %self.identity,
            price  = sample.value,
            reason = %reason,
            "🎯 trigger hit"
        );
        self.close(reason).await;
        true
    }

    /// Idempotent terminal transition. First caller wins the CAS and runs
    /// the close side effects; every later trigger sees CLOSING/CLOSED and
    /// does nothing.
    async fn close(&self, reason: CloseReason) {
        if !self.begin_close() {
            debug!(
                trade     = %self.identity,
                duplicate = %reason,
                "close already in progress — duplicate trigger ignored"
            );
            return;
        }

        let _ = self.close_reason.set(reason);

        if let Err(e) = self.registry.close(&self.identity).await {
            warn!(trade = %self.identity, error = %e, "registry entry removal failed");
        }
        if let Err(e) = self.store.unsubscribe(&self.tick_key).await {
            warn!(trade = %self.identity, error = %e, "unsubscribe failed");
        }

        (self.on_close)();
        self.status.store(TradeStatus::Closed as u8, Ordering::Release);

        let latest = *self.latest_price.read().await;
        info!(
            trade       = %self.identity,
            trade_id    = %self.record.trade_id,
            reason      = %reason,
            take_profit = self.record.take_profit,
            stop_loss   = self.record.stop_loss,
            latest      = ?latest,
            created_at  = %self.record.created_at,
            "trade CLOSE"
        );
    }

    /// `MONITORING → CLOSING` (or `CREATED → CLOSING` for the immediate-
    /// timeout shortcut) as a single atomic check-and-set.
    fn begin_close(&self) -> bool {
        for from in [TradeStatus::Monitoring, TradeStatus::Created] {
            if self
                .status
                .compare_exchange(
                    from as u8,
                    TradeStatus::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn make_record(
        direction: Direction,
        stop_loss: f64,
        take_profit: f64,
        timeout_ms: i64,
        created_at: chrono::DateTime<Utc>,
    ) -> TradeRecord {
        TradeRecord::new(
            "CS.D.GBPJPY.CFD.IP",
            direction,
            stop_loss,
            take_profit,
            Some(timeout_ms),
            created_at,
        )
    }

    async fn open_trade(
        store: &Arc<MemoryStore>,
        record: TradeRecord,
    ) -> (TradeHandle, Arc<AtomicUsize>) {
        let registry = TradeRegistry::new(store.clone() as Arc<dyn Store>);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let on_close: OnTradeClose = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = TradeTracker::open(store.clone() as Arc<dyn Store>, registry, record, on_close)
            .await
            .expect("open failed");
        (handle, closed)
    }

    /// ให้ tracker task ได้คิวประมวลผล notification ที่ค้างอยู่
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_close(handle: &TradeHandle) {
        let wait = async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60 * 60 * 24), wait)
            .await
            .expect("trade did not close");
    }

    // ── Trigger table ─────────────────────────────────────────────────────────

    #[test]
    fn test_trigger_table_buy() {
        use CloseReason::*;
        // stop 100, target 200
        assert_eq!(evaluate_triggers(Direction::Buy, 100.0, 200.0, 150.0), None);
        assert_eq!(evaluate_triggers(Direction::Buy, 100.0, 200.0, 200.0), Some(TakeProfit));
        assert_eq!(evaluate_triggers(Direction::Buy, 100.0, 200.0, 201.0), Some(TakeProfit));
        assert_eq!(evaluate_triggers(Direction::Buy, 100.0, 200.0, 100.0), Some(StopLoss));
        assert_eq!(evaluate_triggers(Direction::Buy, 100.0, 200.0, 99.0),  Some(StopLoss));
    }

    #[test]
    fn test_trigger_table_sell() {
        use CloseReason::*;
        // stop 100, target 50 (SELL กำไรเมื่อราคาลง)
        assert_eq!(evaluate_triggers(Direction::Sell, 100.0, 50.0, 75.0),  None);
        assert_eq!(evaluate_triggers(Direction::Sell, 100.0, 50.0, 50.0),  Some(TakeProfit));
        assert_eq!(evaluate_triggers(Direction::Sell, 100.0, 50.0, 49.5),  Some(TakeProfit));
        assert_eq!(evaluate_triggers(Direction::Sell, 100.0, 50.0, 100.0), Some(StopLoss));
        assert_eq!(evaluate_triggers(Direction::Sell, 100.0, 50.0, 101.0), Some(StopLoss));
    }

    #[test]
    fn test_take_profit_wins_when_levels_crossed() {
        // stop/target กลับด้านกัน — ทั้งคู่เป็นจริงพร้อมกัน → take-profit ชนะ
        assert_eq!(
            evaluate_triggers(Direction::Buy, 300.0, 200.0, 250.0),
            Some(CloseReason::TakeProfit)
        );
        assert_eq!(
            evaluate_triggers(Direction::Sell, 50.0, 100.0, 75.0),
            Some(CloseReason::TakeProfit)
        );
    }

    // ── Lifecycle scenarios ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_buy_closes_on_take_profit_second_update() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, Utc::now());
        let tick_key = record.identity().tick_key();
        let (handle, closed) = open_trade(&store, record).await;

        store.ts_add(&tick_key, 1, 150.0).await.unwrap();
        settle().await;
        assert_eq!(handle.status(), TradeStatus::Monitoring);
        assert_eq!(handle.latest_price().await, Some(150.0));

        store.ts_add(&tick_key, 2, 201.0).await.unwrap();
        wait_for_close(&handle).await;

        assert_eq!(handle.close_reason(), Some(CloseReason::TakeProfit));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        // registry entry removed + unsubscribed
        assert_eq!(store.get(&handle.record.identity().trade_key()).await.unwrap(), None);
        assert!(!store.is_subscribed(&tick_key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_closes_on_stop_loss_second_update() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Sell, 100.0, 50.0, 3 * 60 * 60 * 1000, Utc::now());
        let tick_key = record.identity().tick_key();
        let (handle, _closed) = open_trade(&store, record).await;

        store.ts_add(&tick_key, 1, 90.0).await.unwrap();
        settle().await;
        assert_eq!(handle.status(), TradeStatus::Monitoring);

        store.ts_add(&tick_key, 2, 101.0).await.unwrap();
        wait_for_close(&handle).await;

        assert_eq!(handle.close_reason(), Some(CloseReason::StopLoss));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_without_price_updates() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Buy, 100.0, 200.0, 250, Utc::now());
        let (handle, closed) = open_trade(&store, record).await;

        wait_for_close(&handle).await;

        assert_eq!(handle.close_reason(), Some(CloseReason::Timeout));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timeout_closes_immediately_and_never_subscribes() {
        let store = MemoryStore::new_shared();
        let created = Utc::now() - ChronoDuration::hours(4);
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, created);
        let trade_key = record.identity().trade_key();
        let (handle, closed) = open_trade(&store, record).await;

        assert_eq!(handle.status(), TradeStatus::Closed);
        assert_eq!(handle.close_reason(), Some(CloseReason::Timeout));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscribe_count(), 0);
        assert_eq!(store.get(&trade_key).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_close_is_idempotent() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, Utc::now());
        let (handle, closed) = open_trade(&store, record).await;

        handle.request_close(CloseReason::Explicit);
        wait_for_close(&handle).await;
        assert_eq!(handle.close_reason(), Some(CloseReason::Explicit));

        // ปิดซ้ำ — ต้องเงียบ ไม่ callback ซ้ำ ไม่เปลี่ยน reason
        handle.request_close(CloseReason::Explicit);
        settle().await;
        assert_eq!(handle.close_reason(), Some(CloseReason::Explicit));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_triggers_record_exactly_one_reason() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, Utc::now());
        let tick_key = record.identity().tick_key();
        let (handle, closed) = open_trade(&store, record).await;

        // ยิง price trigger กับ explicit close ใส่ select loop พร้อมกัน
        store.ts_add(&tick_key, 1, 250.0).await.unwrap();
        handle.request_close(CloseReason::Explicit);
        wait_for_close(&handle).await;

        let reason = handle.close_reason().expect("no close reason recorded");
        assert!(
            reason == CloseReason::TakeProfit || reason == CloseReason::Explicit,
            "unexpected reason {reason}"
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_for_same_identity_conflicts() {
        let store = MemoryStore::new_shared();
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, Utc::now());
        let (_handle, _closed) = open_trade(&store, record.clone()).await;

        let registry = TradeRegistry::new(store.clone() as Arc<dyn Store>);
        let on_close: OnTradeClose = Arc::new(|| {});
        let err = TradeTracker::open(
            store.clone() as Arc<dyn Store>,
            registry,
            make_record(Direction::Buy, 90.0, 210.0, 3 * 60 * 60 * 1000, Utc::now()),
            on_close,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_original_window() {
        let store = MemoryStore::new_shared();
        let registry = TradeRegistry::new(store.clone() as Arc<dyn Store>);

        // เปิดไว้เมื่อ 1 ชม. ก่อน (window 3 ชม.) — เหลือ 2 ชม. ไม่ใช่ 3
        let created = Utc::now() - ChronoDuration::hours(1);
        let record = make_record(Direction::Sell, 1.5001, 1.2, 3 * 60 * 60 * 1000, created);
        registry.try_open(&record).await.unwrap();

        let restored = registry.reconstruct_all().await.unwrap();
        assert_eq!(restored.len(), 1);

        let on_close: OnTradeClose = Arc::new(|| {});
        let handle = TradeTracker::resume(
            store.clone() as Arc<dyn Store>,
            registry.clone(),
            restored[0].clone(),
            on_close,
        )
        .await
        .unwrap();

        assert_eq!(handle.status(), TradeStatus::Monitoring);
        assert_eq!(handle.record.close_deadline(), created + ChronoDuration::hours(3));
        // registry entry ยังอยู่ (resume ไม่เขียนซ้ำ ไม่ลบ)
        assert!(store.get(&handle.record.identity().trade_key()).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_past_deadline_closes_and_cleans_registry() {
        let store = MemoryStore::new_shared();
        let registry = TradeRegistry::new(store.clone() as Arc<dyn Store>);

        let created = Utc::now() - ChronoDuration::hours(5);
        let record = make_record(Direction::Buy, 100.0, 200.0, 3 * 60 * 60 * 1000, created);
        registry.try_open(&record).await.unwrap();

        let on_close: OnTradeClose = Arc::new(|| {});
        let handle = TradeTracker::resume(
            store.clone() as Arc<dyn Store>,
            registry,
            record.clone(),
            on_close,
        )
        .await
        .unwrap();

        assert_eq!(handle.status(), TradeStatus::Closed);
        assert_eq!(handle.close_reason(), Some(CloseReason::Timeout));
        // ปิดตอน resume ต้องเก็บกวาด registry entry เดิมด้วย
        assert_eq!(store.get(&record.identity().trade_key()).await.unwrap(), None);
        assert_eq!(store.subscribe_count(), 0);
    }
}
