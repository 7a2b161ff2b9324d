//! Fan-out of master events to follower lanes.
//!
//! Each follower has its own lane: an unbounded queue drained by a dedicated
//! task. Events for one follower are therefore processed strictly in delivery
//! order, while a slow or failing follower never delays the others.
//!
//! Per (event, follower) a lane runs, with the follower config captured when
//! the event was dispatched:
//! 1. enabled check against the live registry
//! 2. dedup claim
//! 3. circuit breaker gate
//! 4. symbol rules lookup and translation
//! 5. rate budget acquisition
//! 6. submission with timeout, retrying transient failures once with the
//!    same client order id
//!
//! and records exactly one outcome to the sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ExchangeClient, ExchangeError, FailureKind};
use crate::models::{
    FollowerAccount, MasterEvent, OrderRequest, ReplicaOrder, ReplicaStatus, SkipReason,
    SymbolRules,
};

use super::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use super::dedup::{Claim, DedupLedger};
use super::rate_budget::RateBudget;
use super::registry::FollowerRegistry;
use super::sink::{TradeRecord, TradeSink};
use super::translator::{translate, Translation};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single exchange call
    pub request_timeout: Duration,
    /// Budget weight of one order submission
    pub order_weight: u32,
    /// Budget weight of one symbol rules fetch
    pub rules_weight: u32,
    /// Extra attempts after a transient failure
    pub transient_retries: u32,
    pub retry_delay: Duration,
    pub force_market_orders: bool,
    pub breaker: BreakerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            order_weight: 1,
            rules_weight: 1,
            transient_retries: 1,
            retry_delay: Duration::from_millis(250),
            force_market_orders: true,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Per-follower view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FollowerStatus {
    pub id: String,
    pub enabled: bool,
    pub copy_ratio: Decimal,
    pub breaker: BreakerSnapshot,
    pub submitted: u64,
    pub rejected: u64,
    pub skipped: u64,
    pub duplicate: u64,
    pub queue_depth: u64,
}

#[derive(Default)]
struct LaneStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    skipped: AtomicU64,
    duplicate: AtomicU64,
    queued: AtomicU64,
}

impl LaneStats {
    fn count(&self, status: ReplicaStatus) {
        let counter = match status {
            ReplicaStatus::Submitted => &self.submitted,
            ReplicaStatus::Rejected => &self.rejected,
            ReplicaStatus::Skipped => &self.skipped,
            ReplicaStatus::Duplicate => &self.duplicate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Job {
    event: Arc<MasterEvent>,
    /// Follower config as of dispatch
    follower: Arc<FollowerAccount>,
    reply: oneshot::Sender<ReplicaOrder>,
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<LaneStats>,
    handle: JoinHandle<()>,
}

/// State shared by all lanes.
struct Shared {
    exchange: Arc<dyn ExchangeClient>,
    budget: Arc<RateBudget>,
    dedup: Arc<DedupLedger>,
    registry: Arc<FollowerRegistry>,
    sink: Arc<dyn TradeSink>,
    rules_cache: RwLock<HashMap<String, SymbolRules>>,
    config: DispatcherConfig,
}

/// Outcomes of one dispatched event, one per follower it was queued for.
pub struct DispatchTicket {
    pub event_id: String,
    pending: Vec<(String, oneshot::Receiver<ReplicaOrder>)>,
}

impl DispatchTicket {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for one follower's outcome.
    pub async fn outcome_for(&mut self, follower_id: &str) -> Option<ReplicaOrder> {
        let idx = self.pending.iter().position(|(id, _)| id == follower_id)?;
        let (_, rx) = self.pending.remove(idx);
        rx.await.ok()
    }

    /// Wait for every outcome. Lanes that shut down mid-flight are omitted.
    pub async fn outcomes(self) -> Vec<ReplicaOrder> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (_, rx) in self.pending {
            if let Ok(outcome) = rx.await {
                out.push(outcome);
            }
        }
        out
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl Dispatcher {
    /// Create the dispatcher and start one lane per registered follower.
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        budget: Arc<RateBudget>,
        dedup: Arc<DedupLedger>,
        registry: Arc<FollowerRegistry>,
        sink: Arc<dyn TradeSink>,
        config: DispatcherConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            exchange,
            budget,
            dedup,
            registry,
            sink,
            rules_cache: RwLock::new(HashMap::new()),
            config,
        });

        let mut lanes = HashMap::new();
        for follower in shared.registry.snapshot().followers.iter() {
            lanes.insert(follower.id.clone(), spawn_lane(shared.clone(), &follower.id));
        }

        Self {
            shared,
            lanes: Mutex::new(lanes),
        }
    }

    /// Queue `event` for every follower enabled in the current snapshot.
    pub fn dispatch(&self, event: Arc<MasterEvent>) -> DispatchTicket {
        self.shared.sink.record(TradeRecord::Master(MasterEvent::clone(&event)));

        let snapshot = self.shared.registry.snapshot();
        let lanes = self.lanes.lock();
        let mut pending = Vec::new();

        for follower in snapshot.enabled() {
            let Some(lane) = lanes.get(&follower.id) else {
                warn!(follower = %follower.id, "No lane for follower");
                continue;
            };

            let (reply, rx) = oneshot::channel();
            let job = Job {
                event: event.clone(),
                follower: follower.clone(),
                reply,
            };
            lane.stats.queued.fetch_add(1, Ordering::Relaxed);
            if lane.tx.send(job).is_err() {
                lane.stats.queued.fetch_sub(1, Ordering::Relaxed);
                warn!(follower = %follower.id, "Lane closed, event not queued");
                continue;
            }
            pending.push((follower.id.clone(), rx));
        }

        debug!(
            event_id = %event.event_id,
            followers = pending.len(),
            version = snapshot.version,
            "Dispatched master event"
        );

        DispatchTicket {
            event_id: event.event_id.clone(),
            pending,
        }
    }

    pub fn breaker(&self, follower_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.lanes.lock().get(follower_id).map(|l| l.breaker.clone())
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.shared.budget
    }

    pub fn registry(&self) -> &Arc<FollowerRegistry> {
        &self.shared.registry
    }

    /// Status of every registered follower.
    pub fn follower_status(&self) -> Vec<FollowerStatus> {
        let snapshot = self.shared.registry.snapshot();
        let lanes = self.lanes.lock();

        snapshot
            .followers
            .iter()
            .filter_map(|f| {
                let lane = lanes.get(&f.id)?;
                Some(FollowerStatus {
                    id: f.id.clone(),
                    enabled: f.enabled,
                    copy_ratio: f.copy_ratio,
                    breaker: lane.breaker.snapshot(),
                    submitted: lane.stats.submitted.load(Ordering::Relaxed),
                    rejected: lane.stats.rejected.load(Ordering::Relaxed),
                    skipped: lane.stats.skipped.load(Ordering::Relaxed),
                    duplicate: lane.stats.duplicate.load(Ordering::Relaxed),
                    queue_depth: lane.stats.queued.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Close all lanes and wait for queued work to finish.
    pub async fn shutdown(&self) {
        let lanes: Vec<(String, Lane)> = self.lanes.lock().drain().collect();
        for (id, lane) in lanes {
            drop(lane.tx);
            if let Err(e) = lane.handle.await {
                error!(follower = %id, error = %e, "Lane task failed");
            }
        }
        info!("Dispatcher stopped");
    }
}

fn spawn_lane(shared: Arc<Shared>, follower_id: &str) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let breaker = Arc::new(CircuitBreaker::new(follower_id, shared.config.breaker));
    let stats = Arc::new(LaneStats::default());

    let id = follower_id.to_string();
    let lane_breaker = breaker.clone();
    let lane_stats = stats.clone();

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            lane_stats.queued.fetch_sub(1, Ordering::Relaxed);

            let Processed { outcome, claimed } =
                process(&shared, &job.follower, &lane_breaker, &job.event).await;

            lane_stats.count(outcome.status);
            if claimed {
                shared
                    .dedup
                    .record_outcome(&outcome.source_event_id, &id, outcome.status);
            }
            shared.sink.record(TradeRecord::Replica(outcome.clone()));
            let _ = job.reply.send(outcome);
        }
        debug!(follower = %id, "Lane closed");
    });

    Lane {
        tx,
        breaker,
        stats,
        handle,
    }
}

fn skipped(event: &MasterEvent, follower_id: &str, reason: SkipReason) -> ReplicaOrder {
    debug!(
        follower = %follower_id,
        event_id = %event.event_id,
        reason = reason.as_str(),
        "Replica skipped"
    );
    ReplicaOrder::without_order(
        event,
        follower_id,
        ReplicaStatus::Skipped,
        Some(reason.as_str().to_string()),
    )
}

/// Terminal outcome of one (event, follower) pair.
struct Processed {
    outcome: ReplicaOrder,
    /// Whether this run holds the dedup claim for the pair
    claimed: bool,
}

/// Run one (event, follower) pair to its terminal outcome.
async fn process(
    shared: &Shared,
    follower: &FollowerAccount,
    breaker: &CircuitBreaker,
    event: &MasterEvent,
) -> Processed {
    let follower_id = follower.id.as_str();

    // Disabled between dispatch and now: nothing was claimed yet.
    if !shared.registry.is_enabled(follower_id) {
        return Processed {
            outcome: skipped(event, follower_id, SkipReason::FollowerDisabled),
            claimed: false,
        };
    }

    if let Claim::AlreadyProcessed(prior) = shared.dedup.check_and_mark(&event.event_id, follower_id)
    {
        debug!(follower = %follower_id, event_id = %event.event_id, "Duplicate master event");
        return Processed {
            outcome: ReplicaOrder::without_order(
                event,
                follower_id,
                ReplicaStatus::Duplicate,
                prior.map(|s| format!("already {}", s)),
            ),
            claimed: false,
        };
    }

    Processed {
        outcome: process_claimed(shared, follower, breaker, event).await,
        claimed: true,
    }
}

async fn process_claimed(
    shared: &Shared,
    follower: &FollowerAccount,
    breaker: &CircuitBreaker,
    event: &MasterEvent,
) -> ReplicaOrder {
    let follower_id = follower.id.as_str();

    if !breaker.check() {
        return skipped(event, follower_id, SkipReason::BreakerOpen);
    }

    let rules = match resolve_rules(shared, follower, &event.symbol).await {
        Ok(rules) => rules,
        Err(e) => {
            warn!(follower = %follower_id, symbol = %event.symbol, error = %e, "No symbol rules");
            return ReplicaOrder::without_order(
                event,
                follower_id,
                ReplicaStatus::Rejected,
                Some(format!("symbol rules unavailable: {}", e)),
            );
        }
    };

    let request = match translate(
        event,
        follower_id,
        follower.copy_ratio,
        &rules,
        shared.config.force_market_orders,
    ) {
        Translation::Order(request) => request,
        Translation::Skip { reason, quantity } => {
            let mut outcome = skipped(event, follower_id, reason);
            outcome.quantity = quantity;
            return outcome;
        }
    };

    submit(shared, follower, breaker, event, request).await
}

async fn submit(
    shared: &Shared,
    follower: &FollowerAccount,
    breaker: &CircuitBreaker,
    event: &MasterEvent,
    request: OrderRequest,
) -> ReplicaOrder {
    let cfg = &shared.config;
    let mut outcome = ReplicaOrder::from_request(event, &follower.id, &request, ReplicaStatus::Rejected);

    loop {
        if let Err(e) = shared.budget.acquire_wait(cfg.order_weight).await {
            error!(follower = %follower.id, error = %e, "Order weight misconfigured");
            outcome.reason = Some(e.to_string());
            return outcome;
        }

        outcome.attempts += 1;
        let result = match tokio::time::timeout(
            cfg.request_timeout,
            shared.exchange.submit_order(&follower.credentials, &request),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ExchangeError::Timeout(cfg.request_timeout)),
        };

        match result {
            Ok(ack) => {
                if let Some(used) = ack.used_weight {
                    shared.budget.sync_used_weight(used);
                }
                breaker.record_success();

                info!(
                    follower = %follower.id,
                    event_id = %event.event_id,
                    symbol = %request.symbol,
                    side = request.side.as_str(),
                    quantity = %request.quantity,
                    exchange_order_id = %ack.exchange_order_id,
                    client_order_id = %ack.client_order_id,
                    order_status = %ack.status,
                    "Replica submitted"
                );

                outcome.status = ReplicaStatus::Submitted;
                outcome.exchange_order_id = Some(ack.exchange_order_id);
                outcome.reason = None;
                return outcome;
            }
            Err(e) if e.confirms_placement(outcome.attempts > 1) => {
                breaker.record_success();

                warn!(
                    follower = %follower.id,
                    event_id = %event.event_id,
                    attempts = outcome.attempts,
                    error = %e,
                    "Replica placed without acknowledgement"
                );

                outcome.status = ReplicaStatus::Submitted;
                outcome.reason = Some(format!("unacknowledged: {}", e));
                return outcome;
            }
            Err(e) if e.is_transient() && outcome.attempts <= cfg.transient_retries => {
                warn!(
                    follower = %follower.id,
                    event_id = %event.event_id,
                    attempt = outcome.attempts,
                    error = %e,
                    "Transient submission failure, retrying"
                );
                tokio::time::sleep(cfg.retry_delay).await;
            }
            Err(e) => {
                if e.kind() == FailureKind::RateLimitedByExchange {
                    shared.budget.exhaust();
                }
                breaker.record_failure();

                warn!(
                    follower = %follower.id,
                    event_id = %event.event_id,
                    kind = e.kind().as_str(),
                    attempts = outcome.attempts,
                    error = %e,
                    "Replica rejected"
                );

                outcome.reason = Some(format!("{}: {}", e.kind().as_str(), e));
                return outcome;
            }
        }
    }
}

/// Follower override first, then cached exchange rules, then a fetch.
async fn resolve_rules(
    shared: &Shared,
    follower: &FollowerAccount,
    symbol: &str,
) -> Result<SymbolRules, String> {
    if let Some(rules) = follower.rules_for(symbol) {
        return Ok(rules.clone());
    }
    let cached = shared.rules_cache.read().get(symbol).cloned();
    if let Some(rules) = cached {
        return Ok(rules);
    }

    shared
        .budget
        .acquire_wait(shared.config.rules_weight)
        .await
        .map_err(|e| e.to_string())?;

    let rules = match tokio::time::timeout(
        shared.config.request_timeout,
        shared.exchange.get_symbol_rules(symbol),
    )
    .await
    {
        Ok(Ok(rules)) => rules,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(ExchangeError::Timeout(shared.config.request_timeout).to_string()),
    };

    shared
        .rules_cache
        .write()
        .insert(symbol.to_string(), rules.clone());
    Ok(rules)
}
