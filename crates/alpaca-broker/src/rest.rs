//! REST client for the Alpaca v2 orders API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{error, info, warn};

use trade_core::hours;
use trade_core::types::OrderStatus;
use trade_core::{Error, Result};

use crate::{normalize_occ, Broker, EquitySide, OptionSide, OrderSnapshot, SubmitOutcome};

/// Wall-clock budget for an order submission.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(8);
/// Wall-clock budget for a status poll.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Submit statuses the broker normally answers a fresh market order with.
/// Anything else is logged loudly but still handled through the order id.
const EXPECTED_SUBMIT_STATUSES: [&str; 5] =
    ["filled", "partially_filled", "accepted", "new", "pending_new"];

/// Alpaca trading-API client.
pub struct AlpacaBroker {
    base_url: String,
    key: String,
    secret: String,
    http: reqwest::Client,
}

impl AlpacaBroker {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
            secret: secret.into(),
            http: reqwest::Client::new(),
        }
    }

    fn orders_url(&self) -> String {
        format!("{}/v2/orders", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &self.key)
            .header("APCA-API-SECRET-KEY", &self.secret)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn submit(&self, body: serde_json::Value, label: &str) -> SubmitOutcome {
        let response = match self
            .authed(self.http.post(self.orders_url()))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(label, error = %e, "order submission transport error");
                return SubmitOutcome::Failed {
                    http_code: None,
                    message: e.to_string(),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(label, http_code = status.as_u16(), body = %text, "order rejected");
            return SubmitOutcome::Failed {
                http_code: Some(status.as_u16()),
                message: truncate(&text, 250).to_string(),
            };
        }

        let payload: OrderResponse = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                error!(label, error = %e, "order response parse error");
                return SubmitOutcome::Failed {
                    http_code: None,
                    message: e.to_string(),
                };
            }
        };

        if let Some(order_status) = payload.status.as_deref() {
            if !EXPECTED_SUBMIT_STATUSES.contains(&order_status) {
                warn!(label, status = order_status, "unexpected submit status");
            }
        }

        match payload.id.clone() {
            Some(order_id) => {
                info!(label, %order_id, "order submitted");
                SubmitOutcome::Accepted {
                    order_id,
                    fill_price: payload.best_price(),
                }
            }
            None => SubmitOutcome::Failed {
                http_code: None,
                message: "order response missing id".to_string(),
            },
        }
    }
}

#[async_trait::async_trait]
impl Broker for AlpacaBroker {
    async fn place_equity_market(
        &self,
        symbol: &str,
        qty: u32,
        side: EquitySide,
    ) -> SubmitOutcome {
        self.submit(equity_order_body(symbol, qty, side), symbol).await
    }

    async fn place_option_market(&self, occ: &str, qty: u32, side: OptionSide) -> SubmitOutcome {
        // Options market orders only during the regular session; the caller
        // decides whether to retry later.
        if !hours::regular_market_open(Utc::now()) {
            info!(occ, qty, "option market order skipped, market closed");
            return SubmitOutcome::MarketClosed;
        }

        let symbol = normalize_occ(occ);
        if symbol.is_empty() {
            return SubmitOutcome::Failed {
                http_code: Some(400),
                message: "missing OCC symbol".to_string(),
            };
        }

        self.submit(option_order_body(symbol, qty, side), symbol).await
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot> {
        if order_id.is_empty() {
            return Err(Error::BrokerApi {
                message: "empty order_id".to_string(),
                status: None,
            });
        }

        let url = format!("{}/{order_id}", self.orders_url());
        let response = self
            .authed(self.http.get(&url))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::BrokerApi {
                message: format!("order status fetch failed: {}", truncate(&text, 250)),
                status: Some(status.as_u16()),
            });
        }

        let payload: OrderResponse = response.json().await?;
        let Some(order_status) = payload.status.as_deref() else {
            return Err(Error::BrokerApi {
                message: format!("order {order_id} response carries no status"),
                status: None,
            });
        };

        Ok(OrderSnapshot {
            status: OrderStatus::parse(order_status),
            filled_avg_price: payload.filled_avg_price,
            filled_at: payload.filled_at,
        })
    }
}

fn equity_order_body(symbol: &str, qty: u32, side: EquitySide) -> serde_json::Value {
    json!({
        "symbol": symbol,
        "qty": qty,
        "side": side.as_str(),
        "type": "market",
        "time_in_force": "day",
    })
}

fn option_order_body(occ: &str, qty: u32, side: OptionSide) -> serde_json::Value {
    json!({
        "symbol": occ,
        "qty": qty,
        "side": side.wire_side().as_str(),
        "type": "market",
        "time_in_force": "day",
        "asset_class": "option",
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Order payload as the broker returns it. Prices arrive as JSON strings.
#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    filled_avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    limit_price: Option<Decimal>,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
}

impl OrderResponse {
    /// Best available price on a submit response. Market orders rarely carry
    /// one; the reconciler reads the real fill later.
    fn best_price(&self) -> Option<Decimal> {
        self.filled_avg_price.or(self.avg_price).or(self.limit_price)
    }
}

/// Accept a decimal encoded as a JSON string, a bare number, or null.
fn lenient_decimal<'de, D>(deserializer: D) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        Some(serde_json::Value::Number(n)) => n.to_string().parse().ok(),
        _ => None,
    })
}
