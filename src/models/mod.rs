//! Domain models shared across the entire Autopilot system.

pub mod session;
pub mod tick;
pub mod trade;

pub use session::{IgAccount, LoginSession, SessionCredentials};
pub use tick::ChartTick;
pub use trade::{CloseReason, Direction, TradeIdentity, TradeRecord, TradeStatus};
