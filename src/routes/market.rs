//! # routes::market
//!
//! Market metadata proxy — ส่งต่อ search ไปยัง provider REST ด้วย session
//! headers ปัจจุบัน

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, state::SharedState};

#[derive(Debug, Deserialize)]
pub struct MarketQuery {
    #[serde(default)]
    pub search: Option<String>,
}

/// GET /api/market?search=FTSE — ค้นหา market จาก provider
pub async fn search_markets(
    State(state): State<SharedState>,
    Query(query): Query<MarketQuery>,
) -> Result<impl IntoResponse, AppError> {
    let payload = state
        .session
        .market_search(query.search.as_deref())
        .await?;

    Ok(Json(json!({
        "ok":      true,
        "markets": payload.get("markets").cloned().unwrap_or(payload),
    })))
}
