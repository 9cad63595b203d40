//! Dispatcher loop: scans managed rows and decides what, if anything, to
//! send this tick.
//!
//! Per row and in order: auto-promote entries the reconciler already saw
//! filled, apply the entry/end time windows, honor force-close requests,
//! then evaluate entry for waiting rows and SL-before-TP for managed
//! positions. Anything that needs an order goes through the atomic send
//! pipeline; rows with a working broker order are left to the reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use trade_core::conditions::{check_entry, check_sl, check_tp};
use trade_core::types::{
    ActiveTrade, DispatchReason, ManageFlag, OrderLink, OrderStatus, Spot, TradeStatus,
};
use trade_core::Result;
use trade_store::TradeStore;

use crate::pipeline::SendPipeline;

pub struct Dispatcher {
    store: Arc<dyn TradeStore>,
    pipeline: SendPipeline,
    interval: Duration,
    /// Pause after every dispatch so the broker is not raced on the very
    /// next tick.
    post_dispatch_delay: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TradeStore>, pipeline: SendPipeline, interval: Duration) -> Self {
        Self {
            store,
            pipeline,
            interval,
            post_dispatch_delay: Duration::from_secs(1),
        }
    }

    /// Test hook: shrink the post-dispatch pause.
    pub fn with_post_dispatch_delay(mut self, delay: Duration) -> Self {
        self.post_dispatch_delay = delay;
        self
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "dispatcher started");
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "dispatcher tick failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One full pass over the managed rows at a fixed instant.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let rows = self.store.fetch_managed_trades().await?;
        for row in rows {
            if let Err(e) = self.handle_row(row, now).await {
                error!(error = %e, "row handling failed");
            }
        }
        Ok(())
    }

    async fn handle_row(&self, mut row: ActiveTrade, now: DateTime<Utc>) -> Result<()> {
        debug!(
            id = %row.id,
            symbol = %row.symbol,
            manage = ?row.manage,
            status = ?row.status,
            order_id = row.order_id.as_deref().unwrap_or_default(),
            order_status = row.order_status.as_deref().unwrap_or_default(),
            "dispatch row"
        );

        // The reconciler may already have seen the entry fill; promote so a
        // second entry order can never go out. Defensive mirror of the
        // reconciler's own transition, idempotent with it.
        if row.status == TradeStatus::NtWaiting
            && matches!(row.order_link(), OrderLink::Real(_))
            && row.broker_status() == Some(OrderStatus::Filled)
        {
            info!(id = %row.id, symbol = %row.symbol, "entry already filled, promoting");
            self.store.mark_filled_and_managing(&row.id).await?;
            row.status = TradeStatus::NtManaging;
        }

        // Time windows apply only to rows under management.
        if row.manage == ManageFlag::Managed {
            if row.status == TradeStatus::NtWaiting {
                if let Some(entry_time) = row.entry_time {
                    if now < entry_time {
                        debug!(id = %row.id, %entry_time, "entry window not open yet");
                        return Ok(());
                    }
                }
                if let Some(end_time) = row.end_time {
                    if now > end_time {
                        info!(id = %row.id, %end_time, "entry window expired, deleting");
                        self.store.delete_trade(&row.id).await?;
                        return Ok(());
                    }
                }
            }

            if row.status.is_managing() {
                if let Some(end_time) = row.end_time {
                    if now > end_time {
                        info!(id = %row.id, %end_time, "management window expired, forcing close");
                        self.store.request_force_close(&row.id).await?;
                        // The next tick sees manage=C and sends the close.
                        return Ok(());
                    }
                }
            }
        }

        if row.manage == ManageFlag::ForceClose {
            return self.handle_force_close(&row, now).await;
        }
        if row.manage != ManageFlag::Managed {
            debug!(id = %row.id, manage = ?row.manage, "row not managed, skipping");
            return Ok(());
        }

        // A working broker order owns the row until the reconciler resolves
        // it; never stack a second order on top.
        if row.has_working_order() {
            debug!(
                id = %row.id,
                order_id = row.order_id.as_deref().unwrap_or_default(),
                order_status = row.order_status.as_deref().unwrap_or_default(),
                "order already working, skipping"
            );
            return Ok(());
        }

        match row.status {
            TradeStatus::NtWaiting => self.try_entry(&row, now).await,
            TradeStatus::NtManaging | TradeStatus::PosManaging => self.try_exit(&row, now).await,
        }
    }

    async fn handle_force_close(&self, row: &ActiveTrade, now: DateTime<Utc>) -> Result<()> {
        info!(id = %row.id, symbol = %row.symbol, status = ?row.status, "force close requested");

        // No position ever existed; the row just goes away.
        if row.status == TradeStatus::NtWaiting {
            self.store.delete_trade(&row.id).await?;
            return Ok(());
        }

        if row.has_working_order() {
            debug!(id = %row.id, "close order already working");
            return Ok(());
        }

        self.dispatch(row, DispatchReason::Force, now).await;
        Ok(())
    }

    async fn try_entry(&self, row: &ActiveTrade, now: DateTime<Utc>) -> Result<()> {
        let Some((spot_under, spot_option)) = self.fetch_spots(row).await else {
            return Ok(());
        };

        let trigger = check_entry(row, spot_under.as_ref(), spot_option.as_ref());
        debug!(
            id = %row.id,
            symbol = %row.symbol,
            fired = trigger.fired,
            price = ?trigger.price_used,
            "entry check"
        );
        if !trigger.fired {
            return Ok(());
        }

        info!(id = %row.id, symbol = %row.symbol, price = ?trigger.price_used, "entry triggered");
        self.dispatch(row, DispatchReason::Entry, now).await;
        Ok(())
    }

    async fn try_exit(&self, row: &ActiveTrade, now: DateTime<Utc>) -> Result<()> {
        let Some((spot_under, spot_option)) = self.fetch_spots(row).await else {
            return Ok(());
        };

        // Risk first: the stop always outranks the target.
        let sl = check_sl(row, spot_under.as_ref(), spot_option.as_ref());
        debug!(id = %row.id, fired = sl.fired, price = ?sl.price_used, "sl check");
        if sl.fired {
            info!(id = %row.id, symbol = %row.symbol, price = ?sl.price_used, "stop-loss hit");
            self.dispatch(row, DispatchReason::Sl, now).await;
            return Ok(());
        }

        let tp = check_tp(row, spot_under.as_ref(), spot_option.as_ref());
        debug!(id = %row.id, fired = tp.fired, price = ?tp.price_used, "tp check");
        if tp.fired {
            info!(id = %row.id, symbol = %row.symbol, price = ?tp.price_used, "take-profit hit");
            self.dispatch(row, DispatchReason::Tp, now).await;
        }
        Ok(())
    }

    /// Both spot rows a check may need; `None` means the store failed and
    /// the row is skipped for this tick.
    async fn fetch_spots(&self, row: &ActiveTrade) -> Option<(Option<Spot>, Option<Spot>)> {
        let spot_under = if row.symbol.is_empty() {
            None
        } else {
            match self.store.fetch_spot(&row.symbol).await {
                Ok(spot) => spot,
                Err(e) => {
                    error!(id = %row.id, symbol = %row.symbol, error = %e, "spot fetch failed");
                    return None;
                }
            }
        };

        let spot_option = match row.occ.as_deref() {
            None | Some("") => None,
            Some(occ) => match self.store.fetch_spot(occ).await {
                Ok(spot) => spot,
                Err(e) => {
                    error!(id = %row.id, occ, error = %e, "option spot fetch failed");
                    return None;
                }
            },
        };

        Some((spot_under, spot_option))
    }

    async fn dispatch(&self, row: &ActiveTrade, reason: DispatchReason, now: DateTime<Utc>) {
        if let Err(e) = self.pipeline.send_order(row, reason, now).await {
            error!(id = %row.id, %reason, error = %e, "send pipeline failed");
        }
        if !self.post_dispatch_delay.is_zero() {
            tokio::time::sleep(self.post_dispatch_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{et_instant, waiting_equity_row, weekday_open_et, ScriptedBroker};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use trade_store::MemoryStore;

    fn dispatcher(store: Arc<MemoryStore>, broker: Arc<ScriptedBroker>) -> Dispatcher {
        let pipeline = SendPipeline::new(store.clone(), broker, 5);
        Dispatcher::new(store, pipeline, Duration::from_secs(1))
            .with_post_dispatch_delay(Duration::ZERO)
    }

    fn spot(instrument: &str, last: rust_decimal::Decimal) -> Spot {
        Spot {
            instrument_id: instrument.to_string(),
            last_price: Some(last),
            tf_closes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_entry_now_dispatches_buy() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        store.upsert_trade(waiting_equity_row("t-1")).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        let submits = broker.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].instrument, "SPY");
        assert_eq!(submits[0].side, "buy");
    }

    #[tokio::test]
    async fn test_entry_skipped_without_spot_row() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        store.upsert_trade(waiting_equity_row("t-1")).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        assert_eq!(broker.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_working_order_is_not_redispatched() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("pending_new".to_string());
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        assert_eq!(broker.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_promote_filled_entry() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("filled".to_string());
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        let stored = store.trade("t-1").await.unwrap();
        assert_eq!(stored.status, TradeStatus::NtManaging);
        assert_eq!(broker.submit_count(), 0, "no second entry order");
    }

    #[tokio::test]
    async fn test_entry_time_gates_waiting_row() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.entry_time = Some(et_instant(2026, 1, 5, 14, 0, 0));
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        // Noon is before the 14:00 entry time.
        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();
        assert_eq!(broker.submit_count(), 0);

        dispatcher(store.clone(), broker.clone())
            .tick(et_instant(2026, 1, 5, 14, 30, 0))
            .await
            .unwrap();
        assert_eq!(broker.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_waiting_row_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.end_time = Some(et_instant(2026, 1, 5, 11, 0, 0));
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        assert!(store.trade("t-1").await.is_none());
        assert_eq!(broker.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_managing_row_is_marked_for_force_close() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.status = TradeStatus::NtManaging;
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("filled".to_string());
        row.end_time = Some(et_instant(2026, 1, 5, 11, 0, 0));
        store.upsert_trade(row).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        let stored = store.trade("t-1").await.unwrap();
        assert_eq!(stored.manage, ManageFlag::ForceClose);
        assert_eq!(stored.comment.as_deref(), Some("time_exit"));
        assert_eq!(broker.submit_count(), 0, "close goes out on the next tick");
    }

    #[tokio::test]
    async fn test_force_close_of_waiting_row_deletes_without_broker() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.manage = ManageFlag::ForceClose;
        store.upsert_trade(row).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        assert!(store.trade("t-1").await.is_none());
        assert_eq!(broker.submit_count(), 0);
        assert!(store.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_close_of_managing_row_sends_sell() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.manage = ManageFlag::ForceClose;
        row.status = TradeStatus::NtManaging;
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("filled".to_string());
        store.upsert_trade(row).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        let submits = broker.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].side, "sell");
        let stored = store.trade("t-1").await.unwrap();
        assert_eq!(stored.comment.as_deref(), Some("force"));
    }

    #[tokio::test]
    async fn test_sl_outranks_tp_when_both_fire() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.status = TradeStatus::NtManaging;
        row.order_id = Some("ord-1".to_string());
        row.order_status = Some("filled".to_string());
        // Make both checks trivially true at once.
        row.sl_enabled = Some(true);
        row.sl_cond = Some("now".to_string());
        row.tp_enabled = Some(true);
        row.tp_level = Some(dec!(1));
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        let stored = store.trade("t-1").await.unwrap();
        assert_eq!(stored.comment.as_deref(), Some("sl"));
    }

    #[tokio::test]
    async fn test_restart_with_pending_order_produces_no_dispatch() {
        // Crash-recovery discipline: a row mid-flight after restart belongs
        // to the reconciler, not the dispatcher.
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker::new());
        let mut row = waiting_equity_row("t-1");
        row.order_id = Some("ord-restart".to_string());
        row.order_status = Some("pending_new".to_string());
        row.send_attempts = 1;
        store.upsert_trade(row).await;
        store.set_spot(spot("SPY", dec!(510))).await;

        dispatcher(store.clone(), broker.clone())
            .tick(weekday_open_et())
            .await
            .unwrap();

        assert_eq!(broker.submit_count(), 0);
        assert_eq!(broker.polls().len(), 0);
    }
}
