//! # models::tick
//!
//! Defines [`ChartTick`], one raw chart-stream update frame as the provider
//! delivers it.
//!
//! Every field except `item` is optional — the stream pushes *deltas*, so a
//! frame carrying only a new offer (or only a volume figure) is expected and
//! normal. Values arrive as strings on the wire; the accessors parse them
//! lazily and treat empty strings as absent.

use serde::{Deserialize, Serialize};

/// A single chart tick received from the streaming feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartTick {
    /// Subscription item name, e.g. `"CHART:CS.D.GBPJPY.CFD.IP:TICK"`.
    pub item: String,

    /// Update time — millisecond epoch timestamp of this tick.
    #[serde(rename = "UTM", default)]
    pub utm: Option<String>,

    /// Bid price.
    #[serde(rename = "BID", default)]
    pub bid: Option<String>,

    /// Offer (ask) price.
    #[serde(rename = "OFR", default)]
    pub ofr: Option<String>,

    /// Last traded volume.
    #[serde(rename = "LTV", default)]
    pub ltv: Option<String>,

    /// Incremental traded volume — logged only, never stored.
    #[serde(rename = "TTV", default)]
    pub ttv: Option<String>,
}

impl ChartTick {
    /// Extracts the epic from the item name:
    /// `"CHART:CS.D.GBPJPY.CFD.IP:TICK"` → `"CS.D.GBPJPY.CFD.IP"`.
    pub fn epic(&self) -> String {
        self.item
            .split(':')
            .filter(|seg| *seg != "CHART" && *seg != super::trade::TICK_TIMEFRAME)
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Millisecond timestamp of this tick, if the frame carried one.
    pub fn update_time(&self) -> Option<u64> {
        parse_field(&self.utm)
    }

    pub fn bid_price(&self) -> Option<f64> {
        parse_field(&self.bid)
    }

    pub fn offer_price(&self) -> Option<f64> {
        parse_field(&self.ofr)
    }

    pub fn last_traded_volume(&self) -> Option<f64> {
        parse_field(&self.ltv)
    }
}

fn parse_field<T: std::str::FromStr>(field: &Option<String>) -> Option<T> {
    field.as_deref().and_then(|s| s.parse().ok())
}
