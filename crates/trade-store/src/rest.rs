//! HTTP adapter for the hosted shared store.
//!
//! Speaks PostgREST conventions: horizontal filters in the query string,
//! `apikey` + bearer headers, and `Prefer: return=representation` on
//! conditional updates so the affected-row count is observable — the
//! pre-lock claim depends on that count.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tracing::debug;

use trade_core::types::{
    ActiveTrade, DispatchReason, ExecutedClose, ExecutedTrade, OrderStatus, Spot,
};
use trade_core::{Error, Result};

use crate::TradeStore;

const TABLE_ACTIVE: &str = "active_trades";
const TABLE_EXECUTED: &str = "executed_trades";
const TABLE_SPOT: &str = "spot";

/// Filter disjunction selecting rows the send pipeline may claim: never
/// submitted, left in pre-lock by a soft failure, or holding a terminal
/// previous order.
const CLAIMABLE_FILTER: &str =
    "(order_id.is.null,order_id.eq.sent,order_status.in.(filled,canceled,rejected,expired))";

/// Stateless client over the shared-store HTTP API.
pub struct RestStore {
    base_url: String,
    http: reqwest::Client,
    headers: HeaderMap,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key_value = HeaderValue::from_str(api_key)
            .map_err(|_| Error::Config("store API key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| Error::Config("store API key is not a valid header value".into()))?;
        headers.insert("apikey", key_value);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            headers,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::StoreApi {
            message: format!("store returned {status}: {}", truncate(&message, 250)),
            status: Some(status.as_u16()),
        })
    }

    /// PATCH with filters, returning how many rows were affected.
    async fn update_where(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: serde_json::Value,
    ) -> Result<u64> {
        let response = self
            .http
            .patch(self.table_url(table))
            .headers(self.headers.clone())
            .header("Prefer", "return=representation")
            .query(filters)
            .json(&body)
            .send()
            .await?;
        let response = self.check(response).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(rows.len() as u64)
    }

    /// Update a single `active_trades` row by id, stamping `updated_at`.
    async fn update_trade(&self, id: &str, mut body: serde_json::Value) -> Result<()> {
        if let Some(map) = body.as_object_mut() {
            map.insert("updated_at".to_string(), json!(Utc::now()));
        }
        let affected = self
            .update_where(TABLE_ACTIVE, &[("id", format!("eq.{id}"))], body)
            .await?;
        debug!(id, affected, "active trade updated");
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl TradeStore for RestStore {
    async fn fetch_managed_trades(&self) -> Result<Vec<ActiveTrade>> {
        let response = self
            .http
            .get(self.table_url(TABLE_ACTIVE))
            .headers(self.headers.clone())
            .query(&[
                ("select", "*"),
                ("manage", "in.(Y,C)"),
                ("order", "created_at.asc"),
            ])
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_trades_by_order_id(&self, order_id: &str) -> Result<Vec<ActiveTrade>> {
        let response = self
            .http
            .get(self.table_url(TABLE_ACTIVE))
            .headers(self.headers.clone())
            .query(&[
                ("select", "*".to_string()),
                ("order_id", format!("eq.{order_id}")),
            ])
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_spot(&self, instrument_id: &str) -> Result<Option<Spot>> {
        let response = self
            .http
            .get(self.table_url(TABLE_SPOT))
            .headers(self.headers.clone())
            .query(&[
                ("select", "*".to_string()),
                ("instrument_id", format!("eq.{instrument_id}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let response = self.check(response).await?;
        let mut rows: Vec<Spot> = response.json().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    async fn claim_for_send(
        &self,
        id: &str,
        expected_attempts: i64,
        reason: DispatchReason,
    ) -> Result<bool> {
        let affected = self
            .update_where(
                TABLE_ACTIVE,
                &[
                    ("id", format!("eq.{id}")),
                    ("send_attempts", format!("eq.{expected_attempts}")),
                    ("or", CLAIMABLE_FILTER.to_string()),
                ],
                json!({
                    "order_id": "sent",
                    "order_status": "working",
                    "comment": format!("{reason}_prelock"),
                    "send_attempts": expected_attempts + 1,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn finalize_sent(
        &self,
        id: &str,
        order_id: &str,
        reason: DispatchReason,
    ) -> Result<()> {
        self.update_trade(
            id,
            json!({
                "order_id": order_id,
                "order_status": "pending_new",
                "comment": reason.as_str(),
            }),
        )
        .await
    }

    async fn freeze_failed(&self, id: &str, comment: &str) -> Result<()> {
        self.update_trade(
            id,
            json!({
                "order_id": "Error",
                "order_status": "error",
                "manage": "N",
                "comment": comment,
            }),
        )
        .await
    }

    async fn mark_filled_and_managing(&self, id: &str) -> Result<()> {
        self.update_trade(
            id,
            json!({
                "order_status": "filled",
                "status": "nt-managing",
            }),
        )
        .await
    }

    async fn set_order_status(&self, id: &str, status: &OrderStatus) -> Result<()> {
        self.update_trade(id, json!({ "order_status": status.as_str() }))
            .await
    }

    async fn freeze_terminal(&self, id: &str, status: &OrderStatus) -> Result<()> {
        self.update_trade(
            id,
            json!({
                "order_status": status.as_str(),
                "manage": "N",
            }),
        )
        .await
    }

    async fn request_force_close(&self, id: &str) -> Result<()> {
        self.update_trade(
            id,
            json!({
                "manage": "C",
                "comment": "time_exit",
            }),
        )
        .await
    }

    async fn delete_trade(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.table_url(TABLE_ACTIVE))
            .headers(self.headers.clone())
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn insert_executed_open(&self, open: &ExecutedTrade) -> Result<()> {
        let response = self
            .http
            .post(self.table_url(TABLE_EXECUTED))
            .headers(self.headers.clone())
            .header("Prefer", "return=minimal")
            .json(open)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn record_executed_close(
        &self,
        active_trade_id: &str,
        close: &ExecutedClose,
    ) -> Result<()> {
        let affected = self
            .update_where(
                TABLE_EXECUTED,
                &[("active_trade_id", format!("eq.{active_trade_id}"))],
                serde_json::to_value(close)?,
            )
            .await?;
        if affected == 0 {
            return Err(Error::StoreApi {
                message: format!("no executed trade open for {active_trade_id}"),
                status: None,
            });
        }
        Ok(())
    }
}
