//! Alpaca brokerage adapter.
//!
//! [`Broker`] is the seam the lifecycle engine submits through;
//! [`rest::AlpacaBroker`] implements it over the v2 orders API and
//! [`stream::TradeStream`] carries the optional trade-updates push channel.

pub mod rest;
pub mod stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use trade_core::types::OrderStatus;
use trade_core::Result;

pub use rest::AlpacaBroker;
pub use stream::{TradeStream, TradeUpdate};

/// Wire side of an equity market order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquitySide {
    Buy,
    Sell,
}

impl EquitySide {
    pub fn as_str(self) -> &'static str {
        match self {
            EquitySide::Buy => "buy",
            EquitySide::Sell => "sell",
        }
    }
}

/// Tradier-style option order sides. Alpaca only understands `buy`/`sell`,
/// so these collapse onto the wire side at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSide {
    BuyToOpen,
    SellToClose,
    SellToOpen,
    BuyToClose,
}

impl OptionSide {
    pub fn wire_side(self) -> EquitySide {
        match self {
            OptionSide::BuyToOpen | OptionSide::BuyToClose => EquitySide::Buy,
            OptionSide::SellToOpen | OptionSide::SellToClose => EquitySide::Sell,
        }
    }
}

/// Result of one market-order submission.
///
/// HTTP rejections are data, not `Err`: the send pipeline buckets them into
/// fatal and soft failures, and a transport error (no HTTP code at all) is
/// one of those buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The broker accepted the order. The price, when present, is whatever
    /// the submit response carried and is not necessarily the fill price.
    Accepted {
        order_id: String,
        fill_price: Option<Decimal>,
    },
    /// Option market order refused locally because the market is closed.
    MarketClosed,
    /// Submission failed; `http_code` is `None` for transport-level errors.
    Failed {
        http_code: Option<u16>,
        message: String,
    },
}

/// Authoritative order state from a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Order submission and status polling. Implementations must be safe for
/// concurrent use: the dispatcher and reconciler share one instance.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_equity_market(&self, symbol: &str, qty: u32, side: EquitySide)
        -> SubmitOutcome;

    async fn place_option_market(&self, occ: &str, qty: u32, side: OptionSide)
        -> SubmitOutcome;

    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot>;
}

/// Strip the `O:` prefix some producers attach to OCC option symbols; the
/// broker expects the bare OCC string.
pub fn normalize_occ(occ: &str) -> &str {
    occ.strip_prefix("O:").unwrap_or(occ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_sides_collapse_to_wire_sides() {
        assert_eq!(OptionSide::BuyToOpen.wire_side(), EquitySide::Buy);
        assert_eq!(OptionSide::BuyToClose.wire_side(), EquitySide::Buy);
        assert_eq!(OptionSide::SellToOpen.wire_side(), EquitySide::Sell);
        assert_eq!(OptionSide::SellToClose.wire_side(), EquitySide::Sell);
    }

    #[test]
    fn test_occ_prefix_normalization() {
        assert_eq!(normalize_occ("O:AMD260102P00180000"), "AMD260102P00180000");
        assert_eq!(normalize_occ("AMD260102P00180000"), "AMD260102P00180000");
        assert_eq!(normalize_occ(""), "");
    }
}
