//! Scripted exchange and sink doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rust_decimal_macros::dec;

use crate::api::{ExchangeClient, ExchangeError, OrderAck, RawEventStream};
use crate::models::{Credentials, OrderRequest, ReplicaOrder, SymbolRules};
use crate::trading::{TradeRecord, TradeSink};

/// Scripted reply to one submission.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Fail(ExchangeError),
    /// Never answer; exercises the submission timeout
    Hang,
}

/// One scripted user stream session.
pub enum Session {
    Frames(Vec<Result<String, ExchangeError>>),
    /// Deliver frames, then stay open without further traffic
    FramesThenIdle(Vec<String>),
    ConnectError(ExchangeError),
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub api_key: String,
    pub order: OrderRequest,
}

/// In-memory exchange keyed by API key.
pub struct MockExchange {
    rules: Mutex<HashMap<String, SymbolRules>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    delays: Mutex<HashMap<String, Duration>>,
    submissions: Mutex<Vec<Submission>>,
    sessions: Mutex<VecDeque<Session>>,
    used_weight: Mutex<Option<u32>>,
    next_id: AtomicU64,
    rule_fetches: AtomicU64,
    stream_opens: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            "BTCUSDT".to_string(),
            SymbolRules {
                quantity_step: dec!(0.001),
                price_tick: dec!(0.1),
                min_notional: dec!(100),
                min_quantity: dec!(0.001),
            },
        );
        rules.insert(
            "ETHUSDT".to_string(),
            SymbolRules {
                quantity_step: dec!(0.001),
                price_tick: dec!(0.01),
                min_notional: dec!(20),
                min_quantity: dec!(0.001),
            },
        );

        Self {
            rules: Mutex::new(rules),
            replies: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            sessions: Mutex::new(VecDeque::new()),
            used_weight: Mutex::new(None),
            next_id: AtomicU64::new(1000),
            rule_fetches: AtomicU64::new(0),
            stream_opens: AtomicU64::new(0),
        }
    }

    /// Queue replies for the account with `api_key`; unscripted calls accept.
    pub fn script(&self, api_key: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .entry(api_key.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn delay(&self, api_key: &str, delay: Duration) {
        self.delays.lock().insert(api_key.to_string(), delay);
    }

    pub fn report_used_weight(&self, weight: u32) {
        *self.used_weight.lock() = Some(weight);
    }

    pub fn push_session(&self, session: Session) {
        self.sessions.lock().push_back(session);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submissions_for(&self, api_key: &str) -> Vec<OrderRequest> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.api_key == api_key)
            .map(|s| s.order.clone())
            .collect()
    }

    pub fn rule_fetches(&self) -> u64 {
        self.rule_fetches.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> u64 {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn submit_order(
        &self,
        creds: &Credentials,
        order: &OrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        self.submissions.lock().push(Submission {
            api_key: creds.api_key.clone(),
            order: order.clone(),
        });

        let delay = self.delays.lock().get(&creds.api_key).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let reply = self
            .replies
            .lock()
            .get_mut(&creds.api_key)
            .and_then(|q| q.pop_front())
            .unwrap_or(Reply::Accept);

        match reply {
            Reply::Accept => Ok(OrderAck {
                exchange_order_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                client_order_id: order.client_order_id.clone(),
                status: "NEW".to_string(),
                used_weight: *self.used_weight.lock(),
            }),
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(ExchangeError::Network("unreachable".into()))
            }
        }
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        self.rule_fetches.fetch_add(1, Ordering::SeqCst);
        self.rules
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("Invalid symbol {}", symbol),
            })
    }

    async fn open_user_stream(&self, _creds: &Credentials) -> Result<RawEventStream, ExchangeError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.lock().pop_front();
        match session {
            Some(Session::Frames(frames)) => Ok(stream::iter(frames).boxed()),
            Some(Session::FramesThenIdle(frames)) => Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(Session::ConnectError(e)) => Err(e),
            None => Ok(stream::pending().boxed()),
        }
    }
}

/// Sink that keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TradeRecord>>,
}

impl MemorySink {
    pub fn replicas(&self) -> Vec<ReplicaOrder> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                TradeRecord::Replica(o) => Some(o.clone()),
                TradeRecord::Master(_) => None,
            })
            .collect()
    }

    pub fn master_events(&self) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r, TradeRecord::Master(_)))
            .count()
    }
}

impl TradeSink for MemorySink {
    fn record(&self, record: TradeRecord) {
        self.records.lock().push(record);
    }
}
