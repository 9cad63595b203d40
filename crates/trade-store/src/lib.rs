//! Shared-store adapter for the trade-lifecycle manager.
//!
//! The store holds the entire durable state of the engine: the
//! `active_trades` work table, the `executed_trades` ledger, and the
//! read-only `spot` snapshot table. [`TradeStore`] is the seam the engine
//! runs against; [`rest::RestStore`] speaks the hosted HTTP API and
//! [`memory::MemoryStore`] backs the test harness with identical claim
//! semantics.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use trade_core::types::{
    ActiveTrade, DispatchReason, ExecutedClose, ExecutedTrade, OrderStatus, Spot,
};
use trade_core::Result;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Storage operations the lifecycle engine needs.
///
/// Every mutation is row-scoped; the only conditional write is
/// [`claim_for_send`](TradeStore::claim_for_send), which is the
/// duplicate-suppression primitive for the whole system.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// All rows with `manage IN (Y, C)`, oldest first.
    async fn fetch_managed_trades(&self) -> Result<Vec<ActiveTrade>>;

    /// Rows carrying this broker order id (used by the push-event listener).
    async fn fetch_trades_by_order_id(&self, order_id: &str) -> Result<Vec<ActiveTrade>>;

    /// Latest snapshot for one instrument, or `None` when the producer has
    /// not written one yet.
    async fn fetch_spot(&self, instrument_id: &str) -> Result<Option<Spot>>;

    /// Pre-lock compare-and-set. Claims the row for one order submission by
    /// writing `order_id="sent"`, `order_status="working"`,
    /// `comment="{reason}_prelock"` and bumping `send_attempts` — but only
    /// if `send_attempts` still equals `expected_attempts` and the row is
    /// claimable (no order ever sent, a retryable `"sent"` sentinel, or a
    /// terminal previous order). Returns whether this caller won the claim.
    async fn claim_for_send(
        &self,
        id: &str,
        expected_attempts: i64,
        reason: DispatchReason,
    ) -> Result<bool>;

    /// Submission succeeded: record the real broker order id and the reason
    /// tag, with `order_status="pending_new"`.
    async fn finalize_sent(&self, id: &str, order_id: &str, reason: DispatchReason)
        -> Result<()>;

    /// Submission failed fatally: `order_id="Error"`, `order_status="error"`,
    /// `manage="N"`, diagnostic comment.
    async fn freeze_failed(&self, id: &str, comment: &str) -> Result<()>;

    /// Confirmed entry fill: `order_status="filled"`, `status="nt-managing"`.
    async fn mark_filled_and_managing(&self, id: &str) -> Result<()>;

    /// Write a broker order status through unchanged.
    async fn set_order_status(&self, id: &str, status: &OrderStatus) -> Result<()>;

    /// Terminal-unfilled order: write the status and freeze the row.
    async fn freeze_terminal(&self, id: &str, status: &OrderStatus) -> Result<()>;

    /// Management window expired: `manage="C"`, `comment="time_exit"`.
    async fn request_force_close(&self, id: &str) -> Result<()>;

    /// Remove the row; deletion is the canonical "closed" signal.
    async fn delete_trade(&self, id: &str) -> Result<()>;

    /// Append the opening half of a ledger record.
    async fn insert_executed_open(&self, open: &ExecutedTrade) -> Result<()>;

    /// Write the closing half onto the ledger record keyed by
    /// `active_trade_id`.
    async fn record_executed_close(
        &self,
        active_trade_id: &str,
        close: &ExecutedClose,
    ) -> Result<()>;
}
