//! In-memory `TradeStore` for the engine test harness.
//!
//! Mirrors the REST adapter's semantics — including the pre-lock
//! compare-and-set — under a single mutex, so the dispatcher, reconciler
//! and pipeline can be exercised concurrently without a live store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use trade_core::types::{
    ActiveTrade, DispatchReason, ExecutedClose, ExecutedTrade, ManageFlag, OrderLink,
    OrderStatus, Spot, TradeStatus,
};
use trade_core::{Error, Result};

use crate::TradeStore;

#[derive(Default)]
struct Inner {
    trades: Vec<ActiveTrade>,
    executed: Vec<ExecutedTrade>,
    spots: HashMap<String, Spot>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace an active trade row.
    pub async fn upsert_trade(&self, row: ActiveTrade) {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.trades.iter_mut().find(|t| t.id == row.id) {
            *existing = row;
        } else {
            inner.trades.push(row);
        }
    }

    /// Seed or replace a spot snapshot.
    pub async fn set_spot(&self, spot: Spot) {
        let mut inner = self.inner.lock().await;
        inner.spots.insert(spot.instrument_id.clone(), spot);
    }

    /// Current state of one row, if it still exists.
    pub async fn trade(&self, id: &str) -> Option<ActiveTrade> {
        let inner = self.inner.lock().await;
        inner.trades.iter().find(|t| t.id == id).cloned()
    }

    /// Full ledger contents.
    pub async fn executed(&self) -> Vec<ExecutedTrade> {
        let inner = self.inner.lock().await;
        inner.executed.clone()
    }

    /// Ledger record for one lifecycle, if any.
    pub async fn executed_for(&self, active_trade_id: &str) -> Option<ExecutedTrade> {
        let inner = self.inner.lock().await;
        inner
            .executed
            .iter()
            .find(|e| e.active_trade_id == active_trade_id)
            .cloned()
    }

    fn claimable(row: &ActiveTrade) -> bool {
        match row.order_link() {
            OrderLink::None | OrderLink::Sent => true,
            OrderLink::Error => false,
            OrderLink::Real(_) => row
                .broker_status()
                .map(|s| s.is_terminal())
                .unwrap_or(false),
        }
    }
}

fn missing_row(id: &str) -> Error {
    Error::StoreApi {
        message: format!("no active trade with id {id}"),
        status: None,
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn fetch_managed_trades(&self) -> Result<Vec<ActiveTrade>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<ActiveTrade> = inner
            .trades
            .iter()
            .filter(|t| !matches!(t.manage, ManageFlag::Frozen))
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn fetch_trades_by_order_id(&self, order_id: &str) -> Result<Vec<ActiveTrade>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.order_id.as_deref() == Some(order_id))
            .cloned()
            .collect())
    }

    async fn fetch_spot(&self, instrument_id: &str) -> Result<Option<Spot>> {
        let inner = self.inner.lock().await;
        Ok(inner.spots.get(instrument_id).cloned())
    }

    async fn claim_for_send(
        &self,
        id: &str,
        expected_attempts: i64,
        reason: DispatchReason,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.trades.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };
        if row.send_attempts != expected_attempts || !Self::claimable(row) {
            return Ok(false);
        }
        row.order_id = Some("sent".to_string());
        row.order_status = Some("working".to_string());
        row.comment = Some(format!("{reason}_prelock"));
        row.send_attempts = expected_attempts + 1;
        row.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn finalize_sent(
        &self,
        id: &str,
        order_id: &str,
        reason: DispatchReason,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.order_id = Some(order_id.to_string());
        row.order_status = Some("pending_new".to_string());
        row.comment = Some(reason.as_str().to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn freeze_failed(&self, id: &str, comment: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.order_id = Some("Error".to_string());
        row.order_status = Some("error".to_string());
        row.manage = ManageFlag::Frozen;
        row.comment = Some(comment.to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_filled_and_managing(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.order_status = Some("filled".to_string());
        row.status = TradeStatus::NtManaging;
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn set_order_status(&self, id: &str, status: &OrderStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.order_status = Some(status.as_str().to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn freeze_terminal(&self, id: &str, status: &OrderStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.order_status = Some(status.as_str().to_string());
        row.manage = ManageFlag::Frozen;
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn request_force_close(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing_row(id))?;
        row.manage = ManageFlag::ForceClose;
        row.comment = Some("time_exit".to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn delete_trade(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.trades.retain(|t| t.id != id);
        Ok(())
    }

    async fn insert_executed_open(&self, open: &ExecutedTrade) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .executed
            .iter()
            .any(|e| e.active_trade_id == open.active_trade_id)
        {
            return Err(Error::StoreApi {
                message: format!("executed trade already open for {}", open.active_trade_id),
                status: Some(409),
            });
        }
        inner.executed.push(open.clone());
        Ok(())
    }

    async fn record_executed_close(
        &self,
        active_trade_id: &str,
        close: &ExecutedClose,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .executed
            .iter_mut()
            .find(|e| e.active_trade_id == active_trade_id)
            .ok_or_else(|| Error::StoreApi {
                message: format!("no executed trade open for {active_trade_id}"),
                status: None,
            })?;
        record.close_ts = Some(close.close_ts);
        record.close_price = Some(close.close_price);
        record.close_cost_basis = Some(close.close_cost_basis);
        record.close_reason = Some(close.close_reason.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use trade_core::types::{AssetType, CloseReason};

    fn waiting_row(id: &str) -> ActiveTrade {
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

    #[tokio::test]
    async fn test_claim_is_won_exactly_once() {
        let store = MemoryStore::new();
        store.upsert_trade(waiting_row("t-1")).await;

        let first = store
            .claim_for_send("t-1", 0, DispatchReason::Entry)
            .await
            .unwrap();
        let second = store
            .claim_for_send("t-1", 0, DispatchReason::Entry)
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "stale attempts token must lose the claim");

        let row = store.trade("t-1").await.unwrap();
        assert_eq!(row.order_id.as_deref(), Some("sent"));
        assert_eq!(row.order_status.as_deref(), Some("working"));
        assert_eq!(row.comment.as_deref(), Some("entry_prelock"));
        assert_eq!(row.send_attempts, 1);
    }

    #[tokio::test]
    async fn test_sent_sentinel_is_reclaimable_with_fresh_token() {
        let store = MemoryStore::new();
        store.upsert_trade(waiting_row("t-1")).await;

        assert!(store
            .claim_for_send("t-1", 0, DispatchReason::Entry)
            .await
            .unwrap());
        // Soft submit failure leaves the pre-lock; the next tick re-reads
        // the row and claims with the bumped token.
        assert!(store
            .claim_for_send("t-1", 1, DispatchReason::Entry)
            .await
            .unwrap());
        assert_eq!(store.trade("t-1").await.unwrap().send_attempts, 2);
    }

    #[tokio::test]
    async fn test_working_real_order_is_not_claimable() {
        let store = MemoryStore::new();
        let mut row = waiting_row("t-1");
        row.order_id = Some("real-id".to_string());
        row.order_status = Some("pending_new".to_string());
        store.upsert_trade(row).await;

        assert!(!store
            .claim_for_send("t-1", 0, DispatchReason::Sl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_terminal_real_order_is_claimable_for_exit() {
        let store = MemoryStore::new();
        let mut row = waiting_row("t-1");
        row.status = TradeStatus::NtManaging;
        row.order_id = Some("real-id".to_string());
        row.order_status = Some("filled".to_string());
        store.upsert_trade(row).await;

        assert!(store
            .claim_for_send("t-1", 0, DispatchReason::Sl)
            .await
            .unwrap());
        assert_eq!(
            store.trade("t-1").await.unwrap().comment.as_deref(),
            Some("sl_prelock")
        );
    }

    #[tokio::test]
    async fn test_frozen_error_row_is_never_claimable() {
        let store = MemoryStore::new();
        let mut row = waiting_row("t-1");
        row.order_id = Some("Error".to_string());
        row.order_status = Some("error".to_string());
        store.upsert_trade(row).await;

        assert!(!store
            .claim_for_send("t-1", 0, DispatchReason::Entry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_frozen_rows_are_not_fetched() {
        let store = MemoryStore::new();
        let mut frozen = waiting_row("t-frozen");
        frozen.manage = ManageFlag::Frozen;
        store.upsert_trade(frozen).await;
        let mut force = waiting_row("t-force");
        force.manage = ManageFlag::ForceClose;
        store.upsert_trade(force).await;
        store.upsert_trade(waiting_row("t-managed")).await;

        let rows = store.fetch_managed_trades().await.unwrap();
        let ids: Vec<_> = rows.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"t-force"));
        assert!(ids.contains(&"t-managed"));
        assert!(!ids.contains(&"t-frozen"));
    }

    #[tokio::test]
    async fn test_ledger_open_then_close() {
        let store = MemoryStore::new();
        let row = waiting_row("t-1");
        let open = ExecutedTrade::open(&row, dec!(510), Utc::now());
        store.insert_executed_open(&open).await.unwrap();

        // Only one open per lifecycle.
        assert!(store.insert_executed_open(&open).await.is_err());

        let close = ExecutedClose::new(dec!(499), 1, AssetType::Equity, CloseReason::Sl, Utc::now());
        store.record_executed_close("t-1", &close).await.unwrap();

        let record = store.executed_for("t-1").await.unwrap();
        assert_eq!(record.open_price, dec!(510));
        assert_eq!(record.close_price, Some(dec!(499)));
        assert_eq!(record.close_reason.as_deref(), Some("sl"));
    }
}
