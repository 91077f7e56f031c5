//! # routes::trade
//!
//! Axum route handlers สำหรับ trade lifecycle (owning-process boundary)
//!
//! | Method | Path          | Description                               |
//! |--------|---------------|-------------------------------------------|
//! | POST   | `/api/trade`  | เปิด trade ใหม่ (409 ถ้า identity ซ้ำ)      |
//! | DELETE | `/api/trade`  | ปิด trade ด้วยเหตุผล EXPLICIT               |
//! | GET    | `/api/trade`  | Snapshot ของ trade ที่ active อยู่           |
//! | GET    | `/api/health` | Liveness + counters                       |

use std::sync::atomic::Ordering;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    engine::TradeTracker,
    error::AppError,
    models::{CloseReason, Direction, TradeIdentity, TradeRecord},
    state::SharedState,
};

// ─── POST /api/trade ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OpenTradeBody {
    pub epic:        String,
    pub direction:   Direction,
    pub stop_loss:   f64,
    pub take_profit: f64,
    /// Override ของ monitoring window (default 3 ชม.)
    #[serde(default)]
    pub timeout_ms:  Option<i64>,
}

/// เปิด trade ใหม่ — persist + subscribe + arm timeout ผ่าน tracker
pub async fn open_trade(
    State(state): State<SharedState>,
    Json(body): Json<OpenTradeBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.epic.is_empty() {
        return Err(AppError::BadRequest("Missing epic field".into()));
    }
    if !body.stop_loss.is_finite() || !body.take_profit.is_finite() {
        return Err(AppError::BadRequest("stopLoss/takeProfit is not a number".into()));
    }
    if body.timeout_ms.is_some_and(|t| t <= 0) {
        return Err(AppError::BadRequest("timeout_ms must be positive".into()));
    }

    let record = TradeRecord::new(
        body.epic,
        body.direction,
        body.stop_loss,
        body.take_profit,
        body.timeout_ms,
        chrono::Utc::now(),
    );
    let identity = record.identity();

    let handle = TradeTracker::open(
        state.store.clone(),
        state.registry.clone(),
        record,
        state.on_close_callback(identity.clone()),
    )
    .await?;

    state.trade_count.fetch_add(1, Ordering::Relaxed);

    let status = handle.status();
    let trade_id = handle.record.trade_id;
    if !handle.is_closed() {
        state.trades.write().await.insert(identity.clone(), handle.clone());
        // Re-check: ถ้า trigger มาเฉือนระหว่าง insert ให้เก็บกวาดเอง
        if handle.is_closed() {
            state.trades.write().await.remove(&identity);
        }
    }

    info!(trade = %identity, %trade_id, ?status, "trade open request accepted");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok":       true,
            "trade_id": trade_id,
            "epic":     identity.epic,
            "direction": identity.direction,
            "status":   status,
            "deadline": handle.record.close_deadline(),
        })),
    ))
}

// ─── DELETE /api/trade ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CloseTradeParams {
    pub epic:      String,
    pub direction: Direction,
}

/// ปิด trade แบบ explicit — ต้องวิ่งผ่าน close path ของ tracker เสมอ
/// (ห้าม bypass ไปลบ registry ตรงๆ ไม่งั้น idempotency guard พัง)
pub async fn close_trade(
    State(state): State<SharedState>,
    Query(params): Query<CloseTradeParams>,
) -> Result<impl IntoResponse, AppError> {
    let identity = TradeIdentity::new(params.epic, params.direction);

    let handle = {
        let trades = state.trades.read().await;
        trades.get(&identity).cloned()
    };
    let Some(handle) = handle else {
        return Err(AppError::NotFound(format!("trade {identity} not found")));
    };

    handle.request_close(CloseReason::Explicit);

    Ok(Json(json!({
        "ok":      true,
        "message": "Trade closed",
        "epic":    identity.epic,
        "direction": identity.direction,
    })))
}

// ─── GET /api/trade ───────────────────────────────────────────────────────────

/// Snapshot ของทุก trade ที่ยัง active (owning-process view)
pub async fn list_trades(State(state): State<SharedState>) -> impl IntoResponse {
    let trades = state.trades.read().await;
    let mut records = Vec::with_capacity(trades.len());
    for handle in trades.values() {
        records.push(json!({
            "trade_id":    handle.record.trade_id,
            "epic":        handle.record.epic,
            "direction":   handle.record.direction,
            "stop_loss":   handle.record.stop_loss,
            "take_profit": handle.record.take_profit,
            "status":      handle.status(),
            "latest_price": handle.latest_price().await,
            "created_at":  handle.record.created_at,
            "deadline":    handle.record.close_deadline(),
        }));
    }

    Json(json!({
        "ok":     true,
        "count":  records.len(),
        "trades": records,
    }))
}

// ─── GET /api/health ──────────────────────────────────────────────────────────

pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let tick_count  = state.tick_count.load(Ordering::Relaxed);
    let trade_count = state.trade_count.load(Ordering::Relaxed);
    let open_trades = state.open_trade_count().await;

    Json(json!({
        "ok":          true,
        "tick_count":  tick_count,
        "trade_count": trade_count,
        "open_trades": open_trades,
    }))
}
