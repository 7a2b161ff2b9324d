//! Live feed of master account fills.
//!
//! Owns the user data stream of the master account and turns it into a
//! sequential channel of [`MasterEvent`]s. On disconnect it reconnects with
//! exponential backoff. The stream has no resume cursor, so fills seen again
//! after a reconnect are passed through and absorbed by the dedup ledger.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ExchangeClient, OrderTradeUpdateEvent, RawEventStream};
use crate::models::{Credentials, MasterEvent, OrderType, PositionSide, Side};

/// What a raw stream frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Fill(MasterEvent),
    /// Recognized but not a fill
    Ignored(String),
    /// The listen key lapsed; the session is over
    ListenKeyExpired,
}

/// Parse one raw user data stream message.
pub fn parse_frame(raw: &str) -> Result<Frame, String> {
    let mut value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid json: {}", e))?;

    // Combined-stream envelope: {"stream": ..., "data": {...}}
    if let Some(data) = value.get_mut("data") {
        value = data.take();
    }

    let event_type = value
        .get("e")
        .and_then(|e| e.as_str())
        .ok_or_else(|| "missing event type".to_string())?
        .to_string();

    match event_type.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let update: OrderTradeUpdateEvent = serde_json::from_value(value)
                .map_err(|e| format!("bad ORDER_TRADE_UPDATE: {}", e))?;
            fill_from_update(update)
        }
        "listenKeyExpired" => Ok(Frame::ListenKeyExpired),
        other => Ok(Frame::Ignored(other.to_string())),
    }
}

fn fill_from_update(update: OrderTradeUpdateEvent) -> Result<Frame, String> {
    let o = update.order;
    if o.execution_type != "TRADE" {
        return Ok(Frame::Ignored(format!("ORDER_TRADE_UPDATE/{}", o.execution_type)));
    }

    let side = Side::parse(&o.side).ok_or_else(|| format!("unknown side {}", o.side))?;
    let order_type = OrderType::parse(&o.order_type)
        .ok_or_else(|| format!("unknown order type {}", o.order_type))?;
    let quantity = Decimal::from_str(&o.last_filled_qty)
        .map_err(|e| format!("bad fill quantity {:?}: {}", o.last_filled_qty, e))?;
    let price = Decimal::from_str(&o.last_filled_price)
        .map_err(|e| format!("bad fill price {:?}: {}", o.last_filled_price, e))?;

    if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
        return Err(format!(
            "non-positive fill {} @ {} on order {}",
            quantity, price, o.order_id
        ));
    }

    let position_side = match o.position_side.as_deref() {
        Some(ps) => PositionSide::parse(ps).ok_or_else(|| format!("unknown position side {}", ps))?,
        None => PositionSide::Both,
    };

    let timestamp = Utc
        .timestamp_millis_opt(o.trade_time)
        .single()
        .or_else(|| Utc.timestamp_millis_opt(update.event_time).single())
        .unwrap_or_else(Utc::now);

    Ok(Frame::Fill(MasterEvent {
        event_id: format!("{}-{}", o.order_id, o.trade_id),
        order_id: o.order_id.to_string(),
        symbol: o.symbol,
        side,
        quantity,
        price,
        order_type,
        position_side,
        reduce_only: o.reduce_only,
        timestamp,
    }))
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Capacity of the event channel to the engine
    pub channel_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            channel_capacity: 1024,
        }
    }
}

/// Source counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub connected: bool,
    pub sessions: u64,
    pub events_delivered: u64,
    pub frames_ignored: u64,
    pub frames_malformed: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SourceStats {
    connected: AtomicBool,
    sessions: AtomicU64,
    events_delivered: AtomicU64,
    frames_ignored: AtomicU64,
    frames_malformed: AtomicU64,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

/// Handle to read source counters while it runs.
#[derive(Clone)]
pub struct SourceMonitor(Arc<SourceStats>);

impl SourceMonitor {
    pub fn status(&self) -> SourceStatus {
        let s = &self.0;
        SourceStatus {
            connected: s.connected.load(Ordering::Relaxed),
            sessions: s.sessions.load(Ordering::Relaxed),
            events_delivered: s.events_delivered.load(Ordering::Relaxed),
            frames_ignored: s.frames_ignored.load(Ordering::Relaxed),
            frames_malformed: s.frames_malformed.load(Ordering::Relaxed),
            last_event_at: *s.last_event_at.lock(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    ReceiverGone,
    Disconnected(String),
}

pub struct MasterSource {
    exchange: Arc<dyn ExchangeClient>,
    credentials: Credentials,
    config: SourceConfig,
    stats: Arc<SourceStats>,
}

impl MasterSource {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        credentials: Credentials,
        config: SourceConfig,
    ) -> Self {
        Self {
            exchange,
            credentials,
            config,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn monitor(&self) -> SourceMonitor {
        SourceMonitor(self.stats.clone())
    }

    /// Start the source task. Events arrive on the returned channel in
    /// stream order; the task ends when `shutdown` flips to true.
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<MasterEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<MasterEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff: ExponentialBackoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_interval(self.config.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let opened = tokio::select! {
                r = self.exchange.open_user_stream(&self.credentials) => Some(r),
                _ = wait_for_shutdown(&mut shutdown) => None,
            };

            match opened {
                None => break,
                Some(Ok(stream)) => {
                    let session = self.stats.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    self.stats.connected.store(true, Ordering::Relaxed);

                    let last = *self.stats.last_event_at.lock();
                    match last {
                        Some(at) => info!(
                            session,
                            gap_secs = (Utc::now() - at).num_seconds(),
                            "Master stream connected"
                        ),
                        None => info!(session, "Master stream connected"),
                    }

                    let end = self.consume(stream, &tx, &mut shutdown, &mut backoff).await;
                    self.stats.connected.store(false, Ordering::Relaxed);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ReceiverGone => {
                            debug!("Event receiver dropped, stopping source");
                            break;
                        }
                        SessionEnd::Disconnected(reason) => {
                            warn!(session, reason = %reason, "Master stream disconnected");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to open master stream");
                }
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting master stream");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Master source stopped");
    }

    async fn consume(
        &self,
        mut stream: RawEventStream,
        tx: &mpsc::Sender<MasterEvent>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> SessionEnd {
        let mut healthy = false;

        loop {
            let frame = tokio::select! {
                f = stream.next() => f,
                _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown,
            };

            let raw = match frame {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                None => return SessionEnd::Disconnected("stream ended".to_string()),
            };

            // A session that delivers data resets the reconnect delay.
            if !healthy {
                healthy = true;
                backoff.reset();
            }

            match parse_frame(&raw) {
                Ok(Frame::Fill(event)) => {
                    debug!(
                        event_id = %event.event_id,
                        symbol = %event.symbol,
                        side = event.side.as_str(),
                        quantity = %event.quantity,
                        "Master fill"
                    );
                    self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                    *self.stats.last_event_at.lock() = Some(event.timestamp);

                    tokio::select! {
                        r = tx.send(event) => {
                            if r.is_err() {
                                return SessionEnd::ReceiverGone;
                            }
                        }
                        _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown,
                    }
                }
                Ok(Frame::Ignored(kind)) => {
                    self.stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
                    debug!(kind = %kind, "Ignoring stream message");
                }
                Ok(Frame::ListenKeyExpired) => {
                    return SessionEnd::Disconnected("listen key expired".to_string());
                }
                Err(e) => {
                    self.stats.frames_malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping malformed stream message");
                }
            }
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExchangeError;
    use crate::testing::{MockExchange, Session};
    use rust_decimal_macros::dec;

    fn trade_frame(order_id: i64, trade_id: i64, qty: &str, price: &str) -> String {
        format!(
            r#"{{"e":"ORDER_TRADE_UPDATE","E":1700000000100,"T":1700000000099,
            "o":{{"s":"BTCUSDT","c":"web_x","S":"BUY","o":"LIMIT","f":"GTC","q":"1",
            "p":"50000","ap":"50000","sp":"0","x":"TRADE","X":"PARTIALLY_FILLED",
            "i":{},"l":"{}","z":"{}","L":"{}","N":"USDT","n":"0","T":1700000000099,
            "t":{},"b":"0","a":"0","m":false,"R":false,"wt":"CONTRACT_PRICE",
            "ot":"LIMIT","ps":"LONG","cp":false,"rp":"0"}}}}"#,
            order_id, qty, qty, price, trade_id
        )
    }

    fn config() -> SourceConfig {
        SourceConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            channel_capacity: 16,
        }
    }

    #[test]
    fn test_parse_fill() {
        let frame = parse_frame(&trade_frame(77, 5, "0.400", "50001.5")).unwrap();
        match frame {
            Frame::Fill(event) => {
                assert_eq!(event.event_id, "77-5");
                assert_eq!(event.order_id, "77");
                assert_eq!(event.quantity, dec!(0.4));
                assert_eq!(event.price, dec!(50001.5));
                assert_eq!(event.side, Side::Buy);
                assert_eq!(event.order_type, OrderType::Limit);
                assert_eq!(event.position_side, PositionSide::Long);
                assert_eq!(event.timestamp.timestamp_millis(), 1700000000099);
            }
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[test]
    fn test_non_fill_messages_are_ignored() {
        let new_order = trade_frame(1, 0, "0", "0").replace(r#""x":"TRADE""#, r#""x":"NEW""#);
        assert_eq!(
            parse_frame(&new_order).unwrap(),
            Frame::Ignored("ORDER_TRADE_UPDATE/NEW".into())
        );

        let account = r#"{"e":"ACCOUNT_UPDATE","E":1,"T":1,"a":{"m":"ORDER","B":[],"P":[]}}"#;
        assert_eq!(
            parse_frame(account).unwrap(),
            Frame::Ignored("ACCOUNT_UPDATE".into())
        );

        assert_eq!(
            parse_frame(r#"{"e":"listenKeyExpired","E":1}"#).unwrap(),
            Frame::ListenKeyExpired
        );
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"result":null,"id":1}"#).is_err());
        assert!(parse_frame(&trade_frame(1, 1, "abc", "1")).is_err());
        assert!(parse_frame(&trade_frame(1, 1, "0", "50000")).is_err());
    }

    #[test]
    fn test_combined_stream_envelope() {
        let wrapped = format!(r#"{{"stream":"key","data":{}}}"#, trade_frame(9, 9, "1", "10"));
        assert!(matches!(parse_frame(&wrapped).unwrap(), Frame::Fill(_)));
    }

    #[tokio::test]
    async fn test_reconnects_and_keeps_order() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_session(Session::ConnectError(ExchangeError::Network("refused".into())));
        exchange.push_session(Session::Frames(vec![
            Ok(trade_frame(1, 1, "1", "50000")),
            Ok("garbage".into()),
            Err(ExchangeError::StreamClosed("reset".into())),
        ]));
        exchange.push_session(Session::FramesThenIdle(vec![
            trade_frame(1, 1, "1", "50000"),
            trade_frame(2, 1, "2", "50000"),
        ]));

        let source = MasterSource::new(exchange.clone(), Credentials::new("m", "s"), config());
        let monitor = source.monitor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut rx, handle) = source.spawn(shutdown_rx);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            ids.push(event.event_id);
        }
        assert_eq!(ids, vec!["1-1", "1-1", "2-1"]);

        let status = monitor.status();
        assert_eq!(status.sessions, 2);
        assert_eq!(status.frames_malformed, 1);
        assert_eq!(status.events_delivered, 3);
        assert!(status.last_event_at.is_some());
        assert_eq!(exchange.stream_opens(), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_listen_key_expiry_triggers_reconnect() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_session(Session::FramesThenIdle(vec![
            r#"{"e":"listenKeyExpired","E":1}"#.to_string(),
            trade_frame(5, 5, "1", "1"),
        ]));
        exchange.push_session(Session::FramesThenIdle(vec![trade_frame(6, 6, "1", "1")]));

        let source = MasterSource::new(exchange.clone(), Credentials::new("m", "s"), config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut rx, handle) = source.spawn(shutdown_rx);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // The fill after the expiry notice belongs to the dead session.
        assert_eq!(event.event_id, "6-6");

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
