//! Scripted broker fake and row fixtures for the engine test harness.
//!
//! The fake records every submission and serves scripted outcomes, so tests
//! can assert exact broker interaction counts — the property the pre-lock
//! protocol exists to guarantee.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;

use alpaca_broker::{Broker, EquitySide, OptionSide, OrderSnapshot, SubmitOutcome};
use trade_core::types::{ActiveTrade, ManageFlag, TradeStatus};
use trade_core::{Error, Result};

/// One recorded POST /orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub instrument: String,
    pub qty: u32,
    pub side: &'static str,
    pub asset_class: &'static str,
}

/// Broker fake with scripted submit outcomes and per-order status snapshots.
#[derive(Default)]
pub struct ScriptedBroker {
    submits: Mutex<Vec<SubmitRecord>>,
    outcomes: Mutex<VecDeque<SubmitOutcome>>,
    snapshots: Mutex<HashMap<String, OrderSnapshot>>,
    polls: Mutex<Vec<String>>,
    next_order: AtomicU64,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next submission. Without a queued outcome
    /// submissions are accepted with a generated order id.
    pub fn push_submit_outcome(&self, outcome: SubmitOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Set what a status poll for `order_id` will report.
    pub fn set_snapshot(&self, order_id: &str, snapshot: OrderSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(order_id.to_string(), snapshot);
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.submits.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    /// Order ids whose status was polled, in order.
    pub fn polls(&self) -> Vec<String> {
        self.polls.lock().unwrap().clone()
    }

    /// The most recently issued generated order id.
    pub fn last_order_id(&self) -> String {
        format!("ord-{}", self.next_order.load(Ordering::SeqCst))
    }

    fn record(&self, record: SubmitRecord) -> SubmitOutcome {
        self.submits.lock().unwrap().push(record);
        if let Some(outcome) = self.outcomes.lock().unwrap().pop_front() {
            return outcome;
        }
        let n = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
        SubmitOutcome::Accepted {
            order_id: format!("ord-{n}"),
            fill_price: None,
        }
    }
}

#[async_trait::async_trait]
impl Broker for ScriptedBroker {
    async fn place_equity_market(
        &self,
        symbol: &str,
        qty: u32,
        side: EquitySide,
    ) -> SubmitOutcome {
        self.record(SubmitRecord {
            instrument: symbol.to_string(),
            qty,
            side: side.as_str(),
            asset_class: "us_equity",
        })
    }

    async fn place_option_market(&self, occ: &str, qty: u32, side: OptionSide) -> SubmitOutcome {
        self.record(SubmitRecord {
            instrument: alpaca_broker::normalize_occ(occ).to_string(),
            qty,
            side: side.wire_side().as_str(),
            asset_class: "option",
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.polls.lock().unwrap().push(order_id.to_string());
        self.snapshots
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::BrokerApi {
                message: format!("no snapshot scripted for {order_id}"),
                status: Some(404),
            })
    }
}

/// A managed `nt-waiting` equity row with an immediate entry.
pub fn waiting_equity_row(id: &str) -> ActiveTrade {
    ActiveTrade {
        id: id.to_string(),
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
        created_at: Some(Utc::now()),
        updated_at: None,
    }
}

/// A UTC instant from an ET wall-clock reading.
pub fn et_instant(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    New_York
        .with_ymd_and_hms(y, mo, d, h, mi, s)
        .unwrap()
        .with_timezone(&Utc)
}

/// Midday on a regular trading Monday; every hours gate is open.
pub fn weekday_open_et() -> DateTime<Utc> {
    et_instant(2026, 1, 5, 12, 0, 0)
}
