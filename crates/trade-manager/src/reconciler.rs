//! Reconciler loop: drives rows with in-flight broker orders to their
//! terminal effects.
//!
//! Only rows with a real order id and a locally non-terminal status are
//! polled. On a transition the appropriate effect is applied: a filled
//! entry opens the ledger record and promotes the row, a filled exit
//! closes the ledger record and deletes the row, a terminal-unfilled
//! order freezes the row, and everything else is written through. All
//! effects are idempotent — re-applying an already-recorded status is a
//! no-op, which is what lets the push-event listener share this code.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use alpaca_broker::{Broker, OrderSnapshot};
use trade_core::types::{
    ActiveTrade, ExecutedClose, ExecutedTrade, ManageFlag, OrderLink, OrderStatus, TradeStatus,
};
use trade_core::Result;
use trade_store::TradeStore;

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TradeStore>,
    broker: Arc<dyn Broker>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TradeStore>, broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            store,
            broker,
            interval,
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "reconciler started");
        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "reconciler tick failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One polling pass over every row with an in-flight order.
    pub async fn tick(&self) -> Result<()> {
        let rows = self.store.fetch_managed_trades().await?;
        for row in rows {
            if let Err(e) = self.reconcile_row(&row).await {
                error!(id = %row.id, error = %e, "reconciliation failed");
            }
        }
        Ok(())
    }

    /// Poll the broker for one row and apply any transition. Rows without a
    /// real order id, or already terminal locally, are skipped — that skip
    /// is what makes double application (poll + push event) harmless.
    pub async fn reconcile_row(&self, row: &ActiveTrade) -> Result<()> {
        if !matches!(row.manage, ManageFlag::Managed | ManageFlag::ForceClose) {
            return Ok(());
        }
        let OrderLink::Real(order_id) = row.order_link() else {
            return Ok(());
        };
        let local_status = row.broker_status();
        if local_status.as_ref().map(OrderStatus::is_terminal) == Some(true) {
            return Ok(());
        }

        let snapshot = match self.broker.order_status(&order_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(id = %row.id, %order_id, error = %e, "order status poll failed");
                return Ok(());
            }
        };

        if local_status.as_ref() == Some(&snapshot.status) {
            return Ok(());
        }

        info!(
            id = %row.id,
            symbol = %row.symbol,
            %order_id,
            local = local_status.as_ref().map(OrderStatus::as_str).unwrap_or_default(),
            broker = %snapshot.status,
            "order status transition"
        );

        self.apply_transition(row, &order_id, &snapshot).await;
        Ok(())
    }

    async fn apply_transition(&self, row: &ActiveTrade, order_id: &str, snapshot: &OrderSnapshot) {
        // Filled entry: record the open, promote to managing.
        if row.status == TradeStatus::NtWaiting && snapshot.status == OrderStatus::Filled {
            match snapshot.filled_avg_price {
                Some(fill_price) => {
                    let open = ExecutedTrade::open(
                        row,
                        fill_price,
                        snapshot.filled_at.unwrap_or_else(Utc::now),
                    );
                    if let Err(e) = self.store.insert_executed_open(&open).await {
                        error!(id = %row.id, error = %e, "executed-trade open insert failed");
                    }
                }
                None => {
                    // Advance anyway; the ledger gap is recoverable offline
                    // from broker history.
                    error!(id = %row.id, %order_id, "entry filled without a fill price");
                }
            }
            if let Err(e) = self.store.mark_filled_and_managing(&row.id).await {
                error!(id = %row.id, error = %e, "promote to managing failed");
            }
            return;
        }

        // Filled exit: record the close, delete the row.
        if row.status.is_managing() && snapshot.status == OrderStatus::Filled {
            let reason = row.close_reason();
            match snapshot.filled_avg_price {
                Some(fill_price) => {
                    let close = ExecutedClose::new(
                        fill_price,
                        row.qty,
                        row.asset_type(),
                        reason,
                        snapshot.filled_at.unwrap_or_else(Utc::now),
                    );
                    if let Err(e) = self.store.record_executed_close(&row.id, &close).await {
                        error!(id = %row.id, error = %e, "executed-trade close failed");
                    }
                }
                None => {
                    error!(
                        id = %row.id,
                        %order_id,
                        reason = reason.as_str(),
                        "exit filled without a fill price"
                    );
                }
            }
            info!(id = %row.id, symbol = %row.symbol, reason = reason.as_str(), "position closed");
            if let Err(e) = self.store.delete_trade(&row.id).await {
                error!(id = %row.id, error = %e, "active-trade delete failed");
            }
            return;
        }

        // Terminal but unfilled: freeze so automation stops for this row.
        if snapshot.status.is_terminal() {
            info!(id = %row.id, %order_id, status = %snapshot.status, "order terminal-unfilled, freezing");
            if let Err(e) = self.store.freeze_terminal(&row.id, &snapshot.status).await {
                error!(id = %row.id, error = %e, "freeze failed");
            }
            return;
        }

        // Non-terminal intermediate: write it through.
        debug!(id = %row.id, %order_id, status = %snapshot.status, "intermediate status");
        if let Err(e) = self.store.set_order_status(&row.id, &snapshot.status).await {
            error!(id = %row.id, error = %e, "order-status write failed");
        }
    }
}
