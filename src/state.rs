//! # state
//!
//! AppState — dependencies ที่ทุก axum handler ใช้ร่วมกัน: store client,
//! trade registry, active-tracker map, session manager และ counters
//!
//! ทุกอย่างถูกสร้างใน `main` แล้ว inject เข้ามาตรงๆ — ไม่มี module-level
//! singleton connection

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::engine::{OnTradeClose, TradeHandle};
use crate::models::TradeIdentity;
use crate::session::SessionManager;
use crate::store::{Store, TradeRegistry};

/// Top-level shared state injected into every Axum handler.
#[derive(Clone)]
pub struct AppState {
    pub store:    Arc<dyn Store>,
    pub registry: TradeRegistry,

    /// Tracker handle ของทุก trade ที่ยัง active
    /// Close path ของ tracker เป็นคนถอด entry ออกผ่าน on-close callback
    pub trades: Arc<RwLock<HashMap<TradeIdentity, TradeHandle>>>,

    pub session: Arc<SessionManager>,

    // ── Metrics ───────────────────────────────────────────────────────────────
    pub tick_count:  Arc<AtomicU64>,
    pub trade_count: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, session: Arc<SessionManager>) -> Self {
        Self {
            registry:    TradeRegistry::new(store.clone()),
            store,
            trades:      Arc::new(RwLock::new(HashMap::new())),
            session,
            tick_count:  Arc::new(AtomicU64::new(0)),
            trade_count: Arc::new(AtomicU64::new(0)),
        }
    }

    // ── Helper Methods ────────────────────────────────────────────────────────

    /// Callback ที่ tracker เรียกตอนปิด — ถอด handle ออกจาก active map
    pub fn on_close_callback(&self, identity: TradeIdentity) -> OnTradeClose {
        let trades = self.trades.clone();
        Arc::new(move || {
            let trades = trades.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                trades.write().await.remove(&identity);
            });
        })
    }

    pub async fn open_trade_count(&self) -> usize {
        self.trades.read().await.len()
    }
}

/// Convenience type alias
pub type SharedState = Arc<AppState>;

pub fn build_state(store: Arc<dyn Store>, session: Arc<SessionManager>) -> SharedState {
    Arc::new(AppState::new(store, session))
}
