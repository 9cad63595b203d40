//! The atomic order-dispatch pipeline.
//!
//! Step 0 gates options to the narrowed RTH window, step 1 claims the row
//! via the pre-lock compare-and-set, step 2 submits the market order, and
//! step 3 finalizes or fails. The pre-lock is the only duplicate-suppression
//! mechanism in the system: across loop ticks, restarts and the two loops,
//! a row is submitted at most once per claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use alpaca_broker::{Broker, EquitySide, OptionSide, SubmitOutcome};
use trade_core::hours;
use trade_core::types::{ActiveTrade, AssetType, DispatchReason};
use trade_core::Result;
use trade_store::TradeStore;

/// HTTP codes that freeze the row immediately: the broker understood the
/// request and said no.
const FATAL_HTTP_CODES: [u16; 4] = [400, 401, 403, 422];

/// What the pipeline did with a dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Order accepted; the reconciler owns the row from here.
    Sent,
    /// Options RTH gate rejected the send; nothing was mutated.
    GateClosed,
    /// Another worker claimed the row first; nothing was submitted.
    LostClaim,
    /// Soft failure; the pre-lock stays in place for a next-tick retry.
    SoftFailed,
    /// Fatal failure or exhausted retry budget; the row is frozen.
    Frozen,
}

pub struct SendPipeline {
    store: Arc<dyn TradeStore>,
    broker: Arc<dyn Broker>,
    max_send_attempts: i64,
}

impl SendPipeline {
    pub fn new(
        store: Arc<dyn TradeStore>,
        broker: Arc<dyn Broker>,
        max_send_attempts: i64,
    ) -> Self {
        Self {
            store,
            broker,
            max_send_attempts,
        }
    }

    /// Run the full pipeline for one row. `row` is the caller's snapshot
    /// from this tick; its `send_attempts` value is the claim token.
    pub async fn send_order(
        &self,
        row: &ActiveTrade,
        reason: DispatchReason,
        now: DateTime<Utc>,
    ) -> Result<SendDisposition> {
        // Step 0: options trade only inside the narrowed RTH window. The
        // row is untouched so the next tick simply tries again.
        if row.is_option() && !hours::options_rth_open(now) {
            info!(
                id = %row.id,
                occ = row.occ.as_deref().unwrap_or_default(),
                %reason,
                "option order outside RTH window, not sending"
            );
            return Ok(SendDisposition::GateClosed);
        }

        // Step 1: pre-lock. Losing the claim means a concurrent worker or a
        // reconciliation already moved the row; silently stand down.
        if !self
            .store
            .claim_for_send(&row.id, row.send_attempts, reason)
            .await?
        {
            debug!(id = %row.id, %reason, "pre-lock claim lost");
            return Ok(SendDisposition::LostClaim);
        }

        // Step 2: submit the market order.
        let outcome = match (row.asset_type(), reason) {
            (AssetType::Equity, DispatchReason::Entry) => {
                self.broker
                    .place_equity_market(&row.symbol, row.qty, EquitySide::Buy)
                    .await
            }
            (AssetType::Equity, _) => {
                self.broker
                    .place_equity_market(&row.symbol, row.qty, EquitySide::Sell)
                    .await
            }
            (AssetType::Option, DispatchReason::Entry) => {
                self.broker
                    .place_option_market(
                        row.occ.as_deref().unwrap_or_default(),
                        row.qty,
                        OptionSide::BuyToOpen,
                    )
                    .await
            }
            (AssetType::Option, _) => {
                self.broker
                    .place_option_market(
                        row.occ.as_deref().unwrap_or_default(),
                        row.qty,
                        OptionSide::SellToClose,
                    )
                    .await
            }
        };

        // Step 3: finalize.
        match outcome {
            SubmitOutcome::Accepted { order_id, .. } => {
                info!(id = %row.id, %reason, %order_id, "order sent");
                // The submit already happened; a failed bookkeeping write is
                // logged, never undone. The reconciler reads the broker as
                // the source of truth either way.
                if let Err(e) = self.store.finalize_sent(&row.id, &order_id, reason).await {
                    error!(id = %row.id, %reason, error = %e, "failed to record order id");
                }
                Ok(SendDisposition::Sent)
            }
            SubmitOutcome::MarketClosed => {
                info!(id = %row.id, %reason, "market closed, leaving pre-lock for retry");
                Ok(SendDisposition::SoftFailed)
            }
            SubmitOutcome::Failed { http_code, message } => {
                self.handle_failure(row, reason, http_code, &message).await
            }
        }
    }

    async fn handle_failure(
        &self,
        row: &ActiveTrade,
        reason: DispatchReason,
        http_code: Option<u16>,
        message: &str,
    ) -> Result<SendDisposition> {
        let soft = matches!(http_code, Some(429)) || matches!(http_code, Some(code) if code >= 500);
        let attempts_used = row.send_attempts + 1;

        if soft && attempts_used < self.max_send_attempts {
            warn!(
                id = %row.id,
                %reason,
                http_code,
                attempts_used,
                error = message,
                "soft submit failure, will retry next tick"
            );
            return Ok(SendDisposition::SoftFailed);
        }

        if soft {
            error!(
                id = %row.id,
                %reason,
                http_code,
                attempts_used,
                "retry budget exhausted, freezing row"
            );
        } else {
            error!(
                id = %row.id,
                %reason,
                http_code,
                error = message,
                "fatal submit failure, freezing row"
            );
        }

        let code_label = http_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let comment = format!("{reason}_error_{code_label}: {}", truncate(message, 150));
        if let Err(e) = self.store.freeze_failed(&row.id, &comment).await {
            error!(id = %row.id, %reason, error = %e, "failed to freeze row");
        }
        Ok(SendDisposition::Frozen)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
