//! Row types and lifecycle vocabulary for the shared store tables.
//!
//! `active_trades` rows are authored by external signal producers, so the
//! free-vocabulary columns (`cp`, `side`, `entry_cond`, …) arrive as loose
//! strings and are parsed through the accessor methods here. The lifecycle
//! columns the engine itself writes (`manage`, `status`) are strict enums.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker order statuses that receive no further transitions.
pub const TERMINAL_ORDER_STATUSES: [OrderStatus; 4] = [
    OrderStatus::Filled,
    OrderStatus::Canceled,
    OrderStatus::Rejected,
    OrderStatus::Expired,
];

/// Automation flag on an active trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManageFlag {
    /// Automation on.
    #[serde(rename = "Y")]
    Managed,
    /// Frozen; the engine never touches the row again.
    #[serde(rename = "N")]
    Frozen,
    /// Force-close requested.
    #[serde(rename = "C")]
    ForceClose,
}

/// Lifecycle status of an active trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    /// No realized position yet; waiting for the entry condition.
    #[serde(rename = "nt-waiting")]
    NtWaiting,
    /// Position opened by this engine; exits are managed here.
    #[serde(rename = "nt-managing")]
    NtManaging,
    /// Position handed over by an external position manager. Treated like
    /// `nt-managing` for exit logic; never assigned by this engine.
    #[serde(rename = "pos-managing")]
    PosManaging,
}

impl TradeStatus {
    pub fn is_managing(self) -> bool {
        matches!(self, TradeStatus::NtManaging | TradeStatus::PosManaging)
    }
}

/// Instrument class of the traded leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetType {
    Equity,
    Option,
}

impl AssetType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetType::Equity => "equity",
            AssetType::Option => "option",
        }
    }
}

/// Call/put right of an option leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Parse the `cp` column; producers write `c`/`call` or `p`/`put`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "c" | "call" => Some(OptionRight::Call),
            "p" | "put" => Some(OptionRight::Put),
            _ => None,
        }
    }
}

/// Long/short direction of the intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }
}

/// Trigger style of an entry or stop-loss condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    /// Fire immediately at the current spot price.
    Now,
    /// Directional touch of a level on the last price.
    At,
    /// Timeframe candle close above the level.
    CloseAbove,
    /// Timeframe candle close below the level.
    CloseBelow,
}

impl TriggerCondition {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "now" => Some(TriggerCondition::Now),
            "at" => Some(TriggerCondition::At),
            "ca" => Some(TriggerCondition::CloseAbove),
            "cb" => Some(TriggerCondition::CloseBelow),
            _ => None,
        }
    }
}

/// Which instrument's spot row a check reads (`entry_type` / `sl_type` /
/// `tp_type` columns). Falls back to the underlying when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriceBasis {
    #[default]
    Equity,
    Option,
}

impl PriceBasis {
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::to_ascii_lowercase).as_deref() {
            Some("option") => PriceBasis::Option,
            _ => PriceBasis::Equity,
        }
    }
}

/// Broker order status vocabulary, plus the engine-written `working` and
/// `error` markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    /// Engine marker: pre-locked, submission in flight.
    Working,
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    /// Engine marker: fatally failed submission.
    Error,
    /// Anything else the broker reports; written through verbatim.
    Other(String),
}

impl OrderStatus {
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "working" => OrderStatus::Working,
            "new" => OrderStatus::New,
            "pending_new" => OrderStatus::PendingNew,
            "accepted" => OrderStatus::Accepted,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            "error" => OrderStatus::Error,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Working => "working",
            OrderStatus::New => "new",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Error => "error",
            OrderStatus::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_ORDER_STATUSES.contains(self)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed view of the `order_id` column and its sentinel values.
///
/// The column progresses monotonically: null → `"sent"` → real id, or to
/// `"Error"` as a terminal freeze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLink {
    /// No submission has ever been attempted.
    None,
    /// Pre-locked: a submission was claimed and may be in flight.
    Sent,
    /// Frozen after a fatal submission failure.
    Error,
    /// A real broker order id.
    Real(String),
}

impl OrderLink {
    pub fn parse(order_id: Option<&str>) -> Self {
        match order_id {
            None => OrderLink::None,
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    OrderLink::None
                } else if trimmed.eq_ignore_ascii_case("sent") {
                    OrderLink::Sent
                } else if trimmed.eq_ignore_ascii_case("error") {
                    OrderLink::Error
                } else {
                    OrderLink::Real(trimmed.to_string())
                }
            }
        }
    }

    pub fn real_id(&self) -> Option<&str> {
        match self {
            OrderLink::Real(id) => Some(id),
            _ => None,
        }
    }
}

/// Why an order is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    Entry,
    Sl,
    Tp,
    Force,
}

impl DispatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchReason::Entry => "entry",
            DispatchReason::Sl => "sl",
            DispatchReason::Tp => "tp",
            DispatchReason::Force => "force",
        }
    }

    /// True for exits; entry is the only opening dispatch.
    pub fn is_exit(self) -> bool {
        !matches!(self, DispatchReason::Entry)
    }
}

impl std::fmt::Display for DispatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason recorded on an executed-trade close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Sl,
    Tp,
    Force,
    /// Fallback when the row carries no recognizable reason tag.
    Close,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Sl => "sl",
            CloseReason::Tp => "tp",
            CloseReason::Force => "force",
            CloseReason::Close => "close",
        }
    }

    /// Parse a reason tag out of the `comment` column.
    pub fn from_comment(comment: Option<&str>) -> Self {
        match comment.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("sl") => CloseReason::Sl,
            Some("tp") => CloseReason::Tp,
            Some("force") => CloseReason::Force,
            _ => CloseReason::Close,
        }
    }
}

/// One row of `active_trades`: one planned or in-flight position lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrade {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub occ: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub cp: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub qty: u32,
    pub manage: ManageFlag,
    pub status: TradeStatus,

    #[serde(default)]
    pub entry_cond: Option<String>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub entry_tf: Option<String>,
    #[serde(default)]
    pub entry_level: Option<Decimal>,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub sl_enabled: Option<bool>,
    #[serde(default)]
    pub sl_cond: Option<String>,
    #[serde(default)]
    pub sl_type: Option<String>,
    #[serde(default)]
    pub sl_tf: Option<String>,
    #[serde(default)]
    pub sl_level: Option<Decimal>,

    #[serde(default)]
    pub tp_enabled: Option<bool>,
    #[serde(default)]
    pub tp_level: Option<Decimal>,
    #[serde(default)]
    pub tp_type: Option<String>,

    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    pub trade_type: Option<String>,
    /// Pre-lock claim counter; doubles as the compare-and-set token for the
    /// send pipeline and as the bounded retry budget.
    #[serde(default)]
    pub send_attempts: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActiveTrade {
    pub fn asset_type(&self) -> AssetType {
        match self.asset_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("option") => AssetType::Option,
            _ => AssetType::Equity,
        }
    }

    pub fn is_option(&self) -> bool {
        self.asset_type() == AssetType::Option
    }

    pub fn option_right(&self) -> Option<OptionRight> {
        self.cp.as_deref().and_then(OptionRight::from_label)
    }

    pub fn trade_side(&self) -> Option<Side> {
        self.side.as_deref().and_then(Side::from_label)
    }

    pub fn entry_condition(&self) -> Option<TriggerCondition> {
        self.entry_cond.as_deref().and_then(TriggerCondition::from_label)
    }

    pub fn sl_condition(&self) -> Option<TriggerCondition> {
        self.sl_cond.as_deref().and_then(TriggerCondition::from_label)
    }

    pub fn entry_basis(&self) -> PriceBasis {
        PriceBasis::from_label(self.entry_type.as_deref())
    }

    pub fn sl_basis(&self) -> PriceBasis {
        PriceBasis::from_label(self.sl_type.as_deref())
    }

    pub fn tp_basis(&self) -> PriceBasis {
        PriceBasis::from_label(self.tp_type.as_deref())
    }

    pub fn order_link(&self) -> OrderLink {
        OrderLink::parse(self.order_id.as_deref())
    }

    pub fn broker_status(&self) -> Option<OrderStatus> {
        self.order_status.as_deref().map(OrderStatus::parse)
    }

    /// A real broker order is in flight and has not reached a terminal
    /// status. Such rows are never re-dispatched; the reconciler owns them.
    /// The `"sent"` pre-lock sentinel is deliberately not a working order —
    /// a soft-failed submission is retried by the next dispatcher tick.
    pub fn has_working_order(&self) -> bool {
        match self.order_link() {
            OrderLink::Real(_) => !self
                .broker_status()
                .map(|s| s.is_terminal())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Direction resolution shared by the `at` trigger and TP: options go by
    /// the call/put right, everything else by `side`, defaulting to long.
    pub fn profit_when_up(&self) -> bool {
        if self.asset_type() == AssetType::Option {
            match self.option_right() {
                Some(OptionRight::Call) => return true,
                Some(OptionRight::Put) => return false,
                None => {}
            }
        }
        self.trade_side() != Some(Side::Short)
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_comment(self.comment.as_deref())
    }

    /// Contract multiplier for cost-basis math.
    pub fn multiplier(&self) -> Decimal {
        match self.asset_type() {
            AssetType::Option => Decimal::from(100),
            AssetType::Equity => Decimal::ONE,
        }
    }

    pub fn sl_disabled(&self) -> bool {
        self.sl_enabled == Some(false)
    }

    pub fn tp_disabled(&self) -> bool {
        self.tp_enabled == Some(false)
    }
}

/// Cost basis of a fill: `price × qty × multiplier`.
pub fn cost_basis(price: Decimal, qty: u32, asset_type: AssetType) -> Decimal {
    let multiplier = match asset_type {
        AssetType::Option => Decimal::from(100),
        AssetType::Equity => Decimal::ONE,
    };
    price * Decimal::from(qty) * multiplier
}

/// One row of the `executed_trades` ledger. Open and close are written
/// separately; the row is keyed by `active_trade_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub active_trade_id: String,
    pub trade_type: String,
    pub symbol: String,
    #[serde(default)]
    pub occ: Option<String>,
    pub asset_type: String,
    pub qty: u32,
    pub open_ts: DateTime<Utc>,
    pub open_price: Decimal,
    pub open_cost_basis: Decimal,
    #[serde(default)]
    pub close_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub close_cost_basis: Option<Decimal>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl ExecutedTrade {
    /// Build the opening ledger record for a confirmed entry fill.
    pub fn open(row: &ActiveTrade, open_price: Decimal, open_ts: DateTime<Utc>) -> Self {
        Self {
            active_trade_id: row.id.clone(),
            trade_type: row
                .trade_type
                .clone()
                .unwrap_or_else(|| "swing".to_string()),
            symbol: row.symbol.clone(),
            occ: row.occ.clone(),
            asset_type: row.asset_type().as_str().to_string(),
            qty: row.qty,
            open_ts,
            open_price,
            open_cost_basis: cost_basis(open_price, row.qty, row.asset_type()),
            close_ts: None,
            close_price: None,
            close_cost_basis: None,
            close_reason: None,
        }
    }
}

/// Closing half of a ledger record, applied to the row keyed by
/// `active_trade_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedClose {
    pub close_ts: DateTime<Utc>,
    pub close_price: Decimal,
    pub close_cost_basis: Decimal,
    pub close_reason: String,
}

impl ExecutedClose {
    pub fn new(
        close_price: Decimal,
        qty: u32,
        asset_type: AssetType,
        reason: CloseReason,
        close_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            close_ts,
            close_price,
            close_cost_basis: cost_basis(close_price, qty, asset_type),
            close_reason: reason.as_str().to_string(),
        }
    }
}

/// Per-timeframe candle close inside a spot row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfClose {
    #[serde(default)]
    pub close: Option<Decimal>,
}

/// Latest market-data snapshot for one instrument. `instrument_id` is the
/// ticker for equities and the OCC code for options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spot {
    pub instrument_id: String,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub tf_closes: HashMap<String, TfClose>,
}

impl Spot {
    pub fn tf_close(&self, tf: &str) -> Option<Decimal> {
        self.tf_closes.get(tf).and_then(|row| row.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_row() -> ActiveTrade {
        ActiveTrade {
            id: "t-1".to_string(),
            symbol: "SPY".to_string(),
            occ: None,
            asset_type: Some("equity".to_string()),
            cp: None,
            side: Some("long".to_string()),
            qty: 1,
            manage: ManageFlag::Managed,
            status: TradeStatus::NtWaiting,
            entry_cond: Some("now".to_string()),
            entry_type: None,
            entry_tf: None,
            entry_level: None,
            entry_time: None,
            end_time: None,
            sl_enabled: None,
            sl_cond: None,
            sl_type: None,
            sl_tf: None,
            sl_level: None,
            tp_enabled: None,
            tp_level: None,
            tp_type: None,
            order_id: None,
            order_status: None,
            comment: None,
            trade_type: None,
            send_attempts: 0,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_order_link_sentinels() {
        assert_eq!(OrderLink::parse(None), OrderLink::None);
        assert_eq!(OrderLink::parse(Some("")), OrderLink::None);
        assert_eq!(OrderLink::parse(Some("sent")), OrderLink::Sent);
        assert_eq!(OrderLink::parse(Some("Sent")), OrderLink::Sent);
        assert_eq!(OrderLink::parse(Some("Error")), OrderLink::Error);
        assert_eq!(
            OrderLink::parse(Some("9048-ab")),
            OrderLink::Real("9048-ab".to_string())
        );
    }

    #[test]
    fn test_terminal_statuses() {
        for label in ["filled", "canceled", "rejected", "expired"] {
            assert!(OrderStatus::parse(label).is_terminal(), "{label}");
        }
        for label in ["working", "pending_new", "accepted", "partially_filled"] {
            assert!(!OrderStatus::parse(label).is_terminal(), "{label}");
        }
        assert!(!OrderStatus::parse("held").is_terminal());
    }

    #[test]
    fn test_working_order_detection() {
        let mut row = base_row();
        assert!(!row.has_working_order());

        row.order_id = Some("sent".to_string());
        row.order_status = Some("working".to_string());
        assert!(!row.has_working_order(), "pre-lock sentinel is retryable");

        row.order_id = Some("real-id".to_string());
        row.order_status = Some("pending_new".to_string());
        assert!(row.has_working_order());

        row.order_status = Some("filled".to_string());
        assert!(!row.has_working_order(), "terminal order is not working");
    }

    #[test]
    fn test_direction_resolution() {
        let mut row = base_row();
        assert!(row.profit_when_up(), "default long");

        row.side = Some("short".to_string());
        assert!(!row.profit_when_up());

        row.asset_type = Some("option".to_string());
        row.cp = Some("c".to_string());
        assert!(row.profit_when_up(), "call overrides side");

        row.cp = Some("put".to_string());
        assert!(!row.profit_when_up());

        // Unknown cp falls back to side.
        row.cp = Some("x".to_string());
        assert!(!row.profit_when_up());
    }

    #[test]
    fn test_close_reason_from_comment() {
        assert_eq!(CloseReason::from_comment(Some("sl")), CloseReason::Sl);
        assert_eq!(CloseReason::from_comment(Some("TP")), CloseReason::Tp);
        assert_eq!(CloseReason::from_comment(Some("force")), CloseReason::Force);
        assert_eq!(
            CloseReason::from_comment(Some("entry_prelock")),
            CloseReason::Close
        );
        assert_eq!(CloseReason::from_comment(None), CloseReason::Close);
    }

    #[test]
    fn test_cost_basis_multiplier() {
        assert_eq!(cost_basis(dec!(510), 1, AssetType::Equity), dec!(510));
        assert_eq!(cost_basis(dec!(1.80), 2, AssetType::Option), dec!(360));
    }

    #[test]
    fn test_executed_open_from_row() {
        let mut row = base_row();
        row.asset_type = Some("option".to_string());
        row.occ = Some("AMD260102C00180000".to_string());
        row.qty = 2;

        let open = ExecutedTrade::open(&row, dec!(1.80), Utc::now());
        assert_eq!(open.open_cost_basis, dec!(360));
        assert_eq!(open.trade_type, "swing");
        assert_eq!(open.asset_type, "option");
        assert!(open.close_ts.is_none());
    }

    #[test]
    fn test_spot_tf_close_lookup() {
        let mut spot = Spot {
            instrument_id: "SPY".to_string(),
            last_price: Some(dec!(510)),
            tf_closes: HashMap::new(),
        };
        spot.tf_closes
            .insert("5m".to_string(), TfClose { close: Some(dec!(509.5)) });
        spot.tf_closes.insert("1h".to_string(), TfClose { close: None });

        assert_eq!(spot.tf_close("5m"), Some(dec!(509.5)));
        assert_eq!(spot.tf_close("1h"), None);
        assert_eq!(spot.tf_close("1d"), None);
    }

    #[test]
    fn test_active_trade_row_deserialization() {
        let raw = serde_json::json!({
            "id": "row-1",
            "symbol": "AMD",
            "occ": "O:AMD260102C00180000",
            "asset_type": "option",
            "cp": "c",
            "qty": 2,
            "manage": "Y",
            "status": "nt-waiting",
            "entry_cond": "now",
            "tp_enabled": true,
            "tp_level": 2.50,
            "tp_type": "option",
            "send_attempts": 1
        });

        let row: ActiveTrade = serde_json::from_value(raw).unwrap();
        assert_eq!(row.status, TradeStatus::NtWaiting);
        assert_eq!(row.manage, ManageFlag::Managed);
        assert_eq!(row.asset_type(), AssetType::Option);
        assert_eq!(row.option_right(), Some(OptionRight::Call));
        assert_eq!(row.tp_basis(), PriceBasis::Option);
        assert_eq!(row.send_attempts, 1);
        assert!(row.side.is_none());
    }
}
