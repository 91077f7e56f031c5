//! # models::trade
//!
//! Defines the trade domain objects: [`TradeRecord`] (the durable snapshot
//! persisted in the Trade Registry), [`TradeIdentity`] (the uniqueness key —
//! one open trade per instrument + direction), lifecycle enums and the
//! storage-key derivation helpers.
//!
//! ## Key scheme
//! ```text
//! CS.D.GBPJPY.CFD.IP:BID:TICK        ← tick samples ที่ BUY trade เฝ้าดู
//! CS.D.GBPJPY.CFD.IP:OFR:TICK        ← tick samples ที่ SELL trade เฝ้าดู
//! CS.D.GBPJPY.CFD.IP:TRADE:BUY       ← registry entry ของ trade ที่เปิดอยู่
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default monitoring window before a trade is force-closed: 3 hours.
pub const DEFAULT_TRADE_TIMEOUT_MS: i64 = 1000 * 60 * 60 * 3;

// ─── Metric / key derivation ──────────────────────────────────────────────────

pub const BID: &str = "BID";
pub const OFR: &str = "OFR";
pub const LTV: &str = "LTV";

/// Timeframe segment for raw tick series.
pub const TICK_TIMEFRAME: &str = "TICK";

/// Registry scan pattern matching every persisted trade entry.
pub const TRADE_KEY_PATTERN: &str = "*:TRADE:*";

/// `{epic}:{metric}:TICK` — the storage key for one metric's tick series.
pub fn metric_key(epic: &str, metric: &str) -> String {
    format!("{epic}:{metric}:{TICK_TIMEFRAME}")
}

// ─── Direction ────────────────────────────────────────────────────────────────

/// Side of the open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// BUY closes at the bid (ราคาที่ broker รับซื้อคืน), SELL closes at the
    /// offer — so that is the metric each side watches.
    pub fn watched_metric(&self) -> &'static str {
        match self {
            Direction::Buy  => BID,
            Direction::Sell => OFR,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy  => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

// ─── TradeIdentity ────────────────────────────────────────────────────────────

/// Uniqueness key for an open trade. The registry guarantees at most one
/// non-closed trade per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeIdentity {
    pub epic:      String,
    pub direction: Direction,
}

impl TradeIdentity {
    pub fn new(epic: impl Into<String>, direction: Direction) -> Self {
        Self { epic: epic.into(), direction }
    }

    /// Price key this trade subscribes to for change notifications.
    pub fn tick_key(&self) -> String {
        metric_key(&self.epic, self.direction.watched_metric())
    }

    /// Registry key holding the persisted [`TradeRecord`].
    pub fn trade_key(&self) -> String {
        format!("{}:TRADE:{}", self.epic, self.direction)
    }
}

impl std::fmt::Display for TradeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.epic, self.direction)
    }
}

// ─── Lifecycle enums ──────────────────────────────────────────────────────────

/// Trade lifecycle states. Transitions only ever move forward:
/// `Created → Monitoring → Closing → Closed` (plus the immediate-timeout
/// shortcut `Created → Closing`).
///
/// `repr(u8)` เพราะ status ถูกเก็บใน `AtomicU8` — terminal transition ใช้
/// compare-exchange เพื่อให้ writer แรกเท่านั้นที่ชนะ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TradeStatus {
    Created    = 0,
    Monitoring = 1,
    Closing    = 2,
    Closed     = 3,
}

impl TradeStatus {
    pub(crate) fn from_u8(v: u8) -> TradeStatus {
        match v {
            0 => TradeStatus::Created,
            1 => TradeStatus::Monitoring,
            2 => TradeStatus::Closing,
            _ => TradeStatus::Closed,
        }
    }
}

/// Why a trade was closed. Exactly one reason is ever recorded per trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Timeout,
    TakeProfit,
    StopLoss,
    /// Owning process ขอปิดเอง (DELETE /api/trade)
    Explicit,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Timeout    => write!(f, "TIMEOUT"),
            CloseReason::TakeProfit => write!(f, "TAKEPROFIT"),
            CloseReason::StopLoss   => write!(f, "STOPLOSS"),
            CloseReason::Explicit   => write!(f, "EXPLICIT"),
        }
    }
}

// ─── TradeRecord ──────────────────────────────────────────────────────────────

/// The durable snapshot of an open trade, serialized into the registry.
///
/// Sufficient to fully reconstruct a tracker after a restart: `created_at`
/// is preserved so the remaining timeout is computed from the original open
/// instant, never restarted from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id:    Uuid,
    pub epic:        String,
    pub direction:   Direction,
    pub stop_loss:   f64,
    pub take_profit: f64,
    /// Monitoring window in milliseconds.
    pub timeout_ms:  i64,
    pub created_at:  DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(
        epic: impl Into<String>,
        direction: Direction,
        stop_loss: f64,
        take_profit: f64,
        timeout_ms: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id:   Uuid::new_v4(),
            epic:       epic.into(),
            direction,
            stop_loss,
            take_profit,
            timeout_ms: timeout_ms.unwrap_or(DEFAULT_TRADE_TIMEOUT_MS),
            created_at,
        }
    }

    pub fn identity(&self) -> TradeIdentity {
        TradeIdentity::new(self.epic.clone(), self.direction)
    }

    /// The instant at which the timeout fires: `created_at + timeout`.
    pub fn close_deadline(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.timeout_ms)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_key_follows_direction() {
        let buy  = TradeIdentity::new("CS.D.GBPJPY.CFD.IP", Direction::Buy);
        let sell = TradeIdentity::new("CS.D.GBPJPY.CFD.IP", Direction::Sell);
        assert_eq!(buy.tick_key(),  "CS.D.GBPJPY.CFD.IP:BID:TICK");
        assert_eq!(sell.tick_key(), "CS.D.GBPJPY.CFD.IP:OFR:TICK");
    }

    #[test]
    fn test_trade_key_layout() {
        let id = TradeIdentity::new("CS.D.USDCAD.CFD.IP", Direction::Sell);
        assert_eq!(id.trade_key(), "CS.D.USDCAD.CFD.IP:TRADE:SELL");
    }

    #[test]
    fn test_close_deadline_is_anchored_to_created_at() {
        // Deadline ต้องคิดจาก created_at เดิม ไม่ใช่เวลาที่ process restart
        let created = Utc::now() - Duration::hours(2);
        let record = TradeRecord::new(
            "CS.D.GBPJPY.CFD.IP", Direction::Buy, 130.0, 300.0, None, created,
        );
        assert_eq!(record.close_deadline(), created + Duration::hours(3));
    }

    #[test]
    fn test_record_roundtrip_preserves_created_at() {
        let created = Utc::now() - Duration::minutes(42);
        let record = TradeRecord::new(
            "IX.D.FTSE.DAILY.IP", Direction::Sell, 101.0, 50.0, Some(60_000), created,
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: TradeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.created_at, created);
    }
}
