//! Binance USDⓈ-M futures client.
//!
//! Signed REST calls use HMAC-SHA256 over the query string. The user data
//! stream is a websocket keyed by a listen key, which has to be kept alive
//! with a PUT every 30 minutes or the exchange closes the stream.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{Credentials, OrderRequest, OrderType, PositionSide, SymbolRules};

use super::exchange::{ExchangeClient, ExchangeError, OrderAck, RawEventStream};
use super::types::{ApiErrorBody, ExchangeInfo, ListenKeyResponse, OrderResponse, SymbolInfo};

pub const FUTURES_REST_URL: &str = "https://fapi.binance.com";
pub const FUTURES_WS_URL: &str = "wss://fstream.binance.com";

/// Binance error code for "too many requests".
const CODE_TOO_MANY_REQUESTS: i64 = -1003;

/// Binance error code for a reused `newClientOrderId`.
const CODE_DUPLICATE_CLIENT_ORDER_ID: i64 = -4116;

const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";

type HmacSha256 = Hmac<Sha256>;

/// Client for the Binance futures REST API and user data stream.
pub struct BinanceFuturesClient {
    http: Client,
    rest_url: String,
    ws_url: String,
    recv_window: u64,
    request_timeout: Duration,
    keepalive_interval: Duration,
}

impl BinanceFuturesClient {
    pub fn new(
        rest_url: impl Into<String>,
        ws_url: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            recv_window: 5000,
            request_timeout,
            keepalive_interval: Duration::from_secs(30 * 60),
        })
    }

    pub fn with_recv_window(mut self, recv_window: u64) -> Self {
        self.recv_window = recv_window;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Send a request and turn non-2xx responses into typed errors.
    async fn send(
        &self,
        method: Method,
        url: &str,
        api_key: Option<&str>,
    ) -> Result<(String, Option<u32>), ExchangeError> {
        let mut req = self.http.request(method, url);
        if let Some(key) = api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        let resp = req.send().await.map_err(|e| self.map_transport_error(e))?;
        let status = resp.status();
        let used_weight = used_weight(resp.headers());
        let retry_after = retry_after(resp.headers());
        let body = resp.text().await.map_err(|e| self.map_transport_error(e))?;

        if let Some(w) = used_weight {
            debug!(used_weight = w, "Binance request weight");
        }

        if status.is_success() {
            Ok((body, used_weight))
        } else {
            Err(classify_response(status, &body, retry_after))
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Timeout(self.request_timeout)
        } else {
            ExchangeError::from(e)
        }
    }

    async fn create_listen_key(&self, creds: &Credentials) -> Result<String, ExchangeError> {
        let url = format!("{}/fapi/v1/listenKey", self.rest_url);
        let (body, _) = self.send(Method::POST, &url, Some(&creds.api_key)).await?;
        let resp: ListenKeyResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Decode(format!("listenKey: {}", e)))?;
        Ok(resp.listen_key)
    }

    fn spawn_keepalive(&self, creds: &Credentials) -> KeepAlive {
        let http = self.http.clone();
        let url = format!("{}/fapi/v1/listenKey", self.rest_url);
        let api_key = creds.api_key.clone();
        let interval = self.keepalive_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match http.put(&url).header(API_KEY_HEADER, &api_key).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("Listen key kept alive");
                    }
                    Ok(resp) => {
                        warn!(status = %resp.status(), "Listen key keepalive rejected");
                    }
                    Err(e) => {
                        warn!(error = %e, "Listen key keepalive failed");
                    }
                }
            }
        });

        KeepAlive(handle)
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn submit_order(
        &self,
        creds: &Credentials,
        order: &OrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        let query = order_query(order, self.recv_window, Utc::now().timestamp_millis());
        let signature = sign(&creds.api_secret, &query)?;
        let url = format!(
            "{}/fapi/v1/order?{}&signature={}",
            self.rest_url, query, signature
        );

        debug!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            quantity = %order.quantity,
            client_order_id = %order.client_order_id,
            "Submitting order"
        );

        let (body, used_weight) = self.send(Method::POST, &url, Some(&creds.api_key)).await?;
        let resp: OrderResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnreadableAck(format!("order response: {}", e)))?;

        Ok(OrderAck {
            exchange_order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            status: resp.status,
            used_weight,
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.rest_url);
        let (body, _) = self.send(Method::GET, &url, None).await?;
        let info: ExchangeInfo = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Decode(format!("exchangeInfo: {}", e)))?;

        let entry = info
            .symbols
            .iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("Invalid symbol {}", symbol),
            })?;

        rules_from_symbol_info(entry)
    }

    async fn open_user_stream(&self, creds: &Credentials) -> Result<RawEventStream, ExchangeError> {
        let listen_key = self.create_listen_key(creds).await?;
        let url = format!("{}/ws/{}", self.ws_url, listen_key);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ExchangeError::Network(format!("websocket connect: {}", e)))?;
        info!("User data stream connected");

        let keepalive = self.spawn_keepalive(creds);

        let frames = stream::unfold(Some((ws, keepalive)), |state| async move {
            let (mut ws, keepalive) = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(text.as_str().to_string()), Some((ws, keepalive))));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return Some((Err(ExchangeError::StreamClosed(reason)), None));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Some((Err(ExchangeError::Network(e.to_string())), None));
                    }
                    None => {
                        return Some((
                            Err(ExchangeError::StreamClosed("connection ended".to_string())),
                            None,
                        ));
                    }
                }
            }
        });

        Ok(frames.boxed())
    }
}

/// Aborts the listen key keepalive when the stream is dropped.
struct KeepAlive(JoinHandle<()>);

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// HMAC-SHA256 signature of a query string, hex encoded.
pub fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Decode(format!("invalid signing key: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Unsigned query string for POST /fapi/v1/order.
pub fn order_query(order: &OrderRequest, recv_window: u64, timestamp_ms: i64) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("symbol", order.symbol.clone()),
        ("side", order.side.as_str().to_string()),
        ("type", order.order_type.as_str().to_string()),
        ("quantity", order.quantity.normalize().to_string()),
    ];

    if order.order_type == OrderType::Limit {
        params.push(("price", order.price.normalize().to_string()));
        params.push(("timeInForce", "GTC".to_string()));
    }

    params.push(("positionSide", order.position_side.as_str().to_string()));

    // Hedge mode infers reduce-only from positionSide and rejects the flag.
    if order.reduce_only && order.position_side == PositionSide::Both {
        params.push(("reduceOnly", "true".to_string()));
    }

    params.push(("newClientOrderId", order.client_order_id.clone()));
    params.push(("recvWindow", recv_window.to_string()));
    params.push(("timestamp", timestamp_ms.to_string()));

    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Map a non-2xx response onto the error taxonomy.
pub fn classify_response(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.msg.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || parsed.as_ref().map(|b| b.code) == Some(CODE_TOO_MANY_REQUESTS)
    {
        return ExchangeError::RateLimited {
            retry_after,
            message,
        };
    }

    if status.is_server_error() {
        return ExchangeError::Network(format!("HTTP {}: {}", status.as_u16(), message));
    }

    match parsed {
        Some(b) if b.code == CODE_DUPLICATE_CLIENT_ORDER_ID => {
            ExchangeError::DuplicateClientOrderId(b.msg)
        }
        Some(b) => ExchangeError::Rejected {
            code: b.code,
            message: b.msg,
        },
        None => ExchangeError::Rejected {
            code: -(status.as_u16() as i64),
            message,
        },
    }
}

/// Extract trading rules from an exchangeInfo symbol entry.
pub fn rules_from_symbol_info(info: &SymbolInfo) -> Result<SymbolRules, ExchangeError> {
    if !info.status.is_empty() && info.status != "TRADING" {
        return Err(ExchangeError::Rejected {
            code: -1121,
            message: format!("{} is not trading ({})", info.symbol, info.status),
        });
    }

    let mut quantity_step = None;
    let mut min_quantity = Decimal::ZERO;
    let mut price_tick = None;
    let mut min_notional = Decimal::ZERO;

    for filter in &info.filters {
        match filter.filter_type.as_str() {
            "LOT_SIZE" => {
                quantity_step = parse_opt(&filter.step_size)?;
                min_quantity = parse_opt(&filter.min_qty)?.unwrap_or(Decimal::ZERO);
            }
            "PRICE_FILTER" => {
                price_tick = parse_opt(&filter.tick_size)?;
            }
            "MIN_NOTIONAL" => {
                min_notional = parse_opt(&filter.notional)?.unwrap_or(Decimal::ZERO);
            }
            _ => {}
        }
    }

    let rules = SymbolRules {
        quantity_step: quantity_step.ok_or_else(|| {
            ExchangeError::Decode(format!("{} has no LOT_SIZE filter", info.symbol))
        })?,
        price_tick: price_tick.ok_or_else(|| {
            ExchangeError::Decode(format!("{} has no PRICE_FILTER filter", info.symbol))
        })?,
        min_notional,
        min_quantity,
    };

    if !rules.is_valid() {
        return Err(ExchangeError::Decode(format!(
            "{} has non-positive steps",
            info.symbol
        )));
    }
    Ok(rules)
}

fn parse_opt(value: &Option<String>) -> Result<Option<Decimal>, ExchangeError> {
    value
        .as_deref()
        .map(|v| {
            Decimal::from_str(v)
                .map(|d| d.normalize())
                .map_err(|e| ExchangeError::Decode(format!("bad decimal {:?}: {}", v, e)))
        })
        .transpose()
}

fn used_weight(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(USED_WEIGHT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
