//! Push-event listener: applies reconciliation as soon as the broker
//! announces an order transition, instead of waiting for the next poll.
//!
//! Events race the dispatcher's own bookkeeping — the broker can announce
//! a fill before the real order id has been persisted to the store — so a
//! lookup that finds nothing is retried briefly before being written off.
//! The effects themselves are the reconciler's, so event and poll are
//! idempotent with each other by construction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use alpaca_broker::TradeUpdate;
use trade_core::types::ActiveTrade;
use trade_store::TradeStore;

use crate::reconciler::Reconciler;

/// Lookup retries while the dispatcher may still be persisting the id.
const LOOKUP_RETRIES: usize = 5;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TradeEventListener {
    store: Arc<dyn TradeStore>,
    reconciler: Reconciler,
}

impl TradeEventListener {
    pub fn new(store: Arc<dyn TradeStore>, reconciler: Reconciler) -> Self {
        Self { store, reconciler }
    }

    /// Drain the stream until it closes.
    pub async fn run(self, mut events: mpsc::Receiver<TradeUpdate>) {
        info!("trade-event listener started");
        while let Some(event) = events.recv().await {
            self.handle_event(&event).await;
        }
        info!("trade-event listener stopped");
    }

    pub async fn handle_event(&self, event: &TradeUpdate) {
        debug!(
            order_id = %event.order_id,
            event = event.event.as_deref().unwrap_or_default(),
            status = event.status.as_deref().unwrap_or_default(),
            "trade update received"
        );

        let Some(rows) = self.find_rows(&event.order_id).await else {
            return;
        };
        if rows.is_empty() {
            warn!(
                order_id = %event.order_id,
                "no active trade carries this order id, even after retries"
            );
            return;
        }

        for row in rows {
            if let Err(e) = self.reconciler.reconcile_row(&row).await {
                error!(id = %row.id, order_id = %event.order_id, error = %e, "event reconciliation failed");
            }
        }
    }

    async fn find_rows(&self, order_id: &str) -> Option<Vec<ActiveTrade>> {
        for attempt in 0..=LOOKUP_RETRIES {
            match self.store.fetch_trades_by_order_id(order_id).await {
                Ok(rows) if !rows.is_empty() => {
                    if attempt > 0 {
                        debug!(order_id, attempt, "order id appeared after retry");
                    }
                    return Some(rows);
                }
                Ok(_) => {
                    if attempt < LOOKUP_RETRIES {
                        tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
                    }
                }
                Err(e) => {
                    error!(order_id, error = %e, "order id lookup failed");
                    return None;
                }
            }
        }
        Some(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{waiting_equity_row, ScriptedBroker};
    use alpaca_broker::OrderSnapshot;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use trade_core::types::{OrderStatus, TradeStatus};
    use trade_store::MemoryStore;

    fn listener(
        store: Arc<MemoryStore>,
        broker: Arc<ScriptedBroker>,
    ) -> TradeEventListener {
        let reconciler = Reconciler::new(store.clone(), broker, Duration::from_secs(1));
        TradeEventListener::new(store, reconciler)
    }

    fn fill_event(order_id: &str) -> TradeUpdate {
        TradeUpdate {
            event: Some("fill".to_string()),
            order_id: order_id.to_string(),
            status: Some("filled".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fill_event_promotes_entry() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("pending_new".to_string());
        row.comment = Some("entry".to_string());
        store.upsert_trade(row).await;
        broker.set_snapshot(
            "ord-1",
            OrderSnapshot {
                status: OrderStatus::Filled,
                filled_avg_price: Some(dec!(510)),
                filled_at: Some(Utc::now()),
            },
        );

        listener(store.clone(), broker.clone())
            .handle_event(&fill_event("ord-1"))
            .await;

        let stored = store.trade("t-1").await.unwrap();
        assert_eq!(stored.status, TradeStatus::NtManaging);
        assert_eq!(store.executed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_events_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("pending_new".to_string());
        row.comment = Some("entry".to_string());
        store.upsert_trade(row).await;
        broker.set_snapshot(
            "ord-1",
            OrderSnapshot {
                status: OrderStatus::Filled,
                filled_avg_price: Some(dec!(510)),
                filled_at: Some(Utc::now()),
            },
        );

        let l = listener(store.clone(), broker.clone());
        l.handle_event(&fill_event("ord-1")).await;
        let after_first = store.trade("t-1").await.unwrap();
        l.handle_event(&fill_event("ord-1")).await;
        let after_second = store.trade("t-1").await.unwrap();

        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.order_status, after_second.order_status);
        assert_eq!(store.executed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_for_unknown_order_is_dropped_after_retries() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        store.upsert_trade(waiting_equity_row("t-1")).await;

        listener(store.clone(), broker.clone())
            .handle_event(&fill_event("ord-nowhere"))
            .await;

        let stored = store.trade("t-1").await.unwrap();
        assert!(stored.order_id.is_none(), "unrelated rows untouched");
    }
}
