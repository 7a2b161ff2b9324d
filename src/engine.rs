//! Engine runner: wires the master feed to the dispatcher and owns the
//! lifecycle.
//!
//! Handles:
//! - Forwarding master fills to the dispatcher in arrival order
//! - Logging per-event outcome summaries
//! - Periodic dedup pruning and engine-state persistence
//! - Runtime control through [`ControlHandle`]
//! - Graceful shutdown that drains follower lanes and flushes records

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{BinanceFuturesClient, ExchangeClient, PaperExchange};
use crate::config::AppConfig;
use crate::db::Database;
use crate::models::{ReplicaOrder, ReplicaStatus};
use crate::trading::{
    BudgetStatus, DbSink, DedupLedger, DispatchTicket, Dispatcher, FollowerRegistry,
    FollowerStatus, MasterSource, RegistryError, SourceMonitor, SourceStatus, TradeSink,
    wait_for_shutdown,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Main engine runner.
pub struct Engine {
    db: Arc<Database>,
    sink: Arc<DbSink>,
    dispatcher: Arc<Dispatcher>,
    dedup: Arc<DedupLedger>,
    source: Option<MasterSource>,
    prune_interval: Duration,
    state: Arc<RunState>,
    shutdown: Arc<watch::Sender<bool>>,
}

struct RunState {
    dry_run: bool,
    started_at: Instant,
    running: AtomicBool,
    events_received: AtomicU64,
}

impl Engine {
    /// Build the exchange client for `config` and assemble the engine.
    pub async fn from_config(config: &AppConfig, dry_run: bool) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_url).await?);

        let client = BinanceFuturesClient::new(
            &config.exchange.rest_url,
            &config.exchange.ws_url,
            config.request_timeout(),
        )?
        .with_recv_window(config.exchange.recv_window)
        .with_keepalive_interval(Duration::from_secs(config.exchange.keepalive_mins * 60));

        let exchange: Arc<dyn ExchangeClient> = if dry_run {
            info!("Dry run: orders will be logged, not submitted");
            Arc::new(PaperExchange::new(Arc::new(client)))
        } else {
            Arc::new(client)
        };

        Ok(Self::new(config, exchange, db, dry_run))
    }

    /// Assemble the engine around an existing exchange client and database.
    pub fn new(
        config: &AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        db: Arc<Database>,
        dry_run: bool,
    ) -> Self {
        let (sink, _writer) = DbSink::spawn(db.clone());
        let sink = Arc::new(sink);
        let dedup = Arc::new(config.dedup_ledger());
        let registry = Arc::new(FollowerRegistry::new(config.follower_accounts()));

        let dispatcher = Arc::new(Dispatcher::new(
            exchange.clone(),
            Arc::new(config.rate_budget()),
            dedup.clone(),
            registry,
            sink.clone() as Arc<dyn TradeSink>,
            config.dispatcher_config(),
        ));

        let source = MasterSource::new(exchange, config.master_credentials(), config.source_config());
        let (shutdown, _) = watch::channel(false);

        Self {
            db,
            sink,
            dispatcher,
            dedup,
            source: Some(source),
            prune_interval: Duration::from_secs(config.dedup.prune_interval_secs.max(1)),
            state: Arc::new(RunState {
                dry_run,
                started_at: Instant::now(),
                running: AtomicBool::new(false),
                events_received: AtomicU64::new(0),
            }),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Handle for status queries and runtime control.
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            dispatcher: self.dispatcher.clone(),
            dedup: self.dedup.clone(),
            monitor: self.source.as_ref().map(|s| s.monitor()),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Main run loop. Returns after Ctrl+C or [`ControlHandle::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .context("Engine has already been run")?;

        let followers = self.dispatcher.registry().snapshot().followers.len();
        info!(dry_run = self.state.dry_run, followers, "Starting copy engine");

        self.db.mark_engine_started(self.state.dry_run, followers).await?;
        self.state.running.store(true, Ordering::SeqCst);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.send_replace(true);
            }
        });

        let monitor = source.monitor();
        let mut shutdown_rx = self.shutdown.subscribe();
        let (mut events, source_handle) = source.spawn(self.shutdown.subscribe());

        let mut prune = interval(self.prune_interval);
        let mut progress = interval(PROGRESS_INTERVAL);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Master source ended");
                        break;
                    };
                    self.state.events_received.fetch_add(1, Ordering::Relaxed);
                    let ticket = self.dispatcher.dispatch(Arc::new(event));
                    tokio::spawn(log_outcomes(ticket));
                }
                _ = prune.tick() => {
                    let removed = self.dedup.prune();
                    if removed > 0 {
                        debug!(removed, remaining = self.dedup.len(), "Pruned dedup ledger");
                    }
                }
                _ = progress.tick() => {
                    self.save_progress(&monitor).await;
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        self.shutdown_gracefully(source_handle, &monitor).await
    }

    async fn save_progress(&self, monitor: &SourceMonitor) {
        let received = self.state.events_received.load(Ordering::Relaxed);
        let last = monitor.status().last_event_at;
        if let Err(e) = self.db.update_engine_progress(received, last).await {
            warn!(error = %e, "Failed to save engine progress");
        }
    }

    /// Graceful shutdown.
    async fn shutdown_gracefully(
        &self,
        source_handle: tokio::task::JoinHandle<()>,
        monitor: &SourceMonitor,
    ) -> Result<()> {
        info!("Shutting down copy engine...");
        self.shutdown.send_replace(true);

        if let Err(e) = source_handle.await {
            error!(error = %e, "Master source task failed");
        }

        // In-flight and queued events complete before lanes close.
        self.dispatcher.shutdown().await;
        self.sink.flush().await;

        self.save_progress(monitor).await;
        self.db.mark_engine_stopped().await?;
        self.state.running.store(false, Ordering::SeqCst);

        info!(
            events = self.state.events_received.load(Ordering::Relaxed),
            "Copy engine shutdown complete"
        );
        Ok(())
    }
}

async fn log_outcomes(ticket: DispatchTicket) {
    let event_id = ticket.event_id.clone();
    let outcomes: Vec<ReplicaOrder> = ticket.outcomes().await;

    let count = |status: ReplicaStatus| outcomes.iter().filter(|o| o.status == status).count();
    let rejected = count(ReplicaStatus::Rejected);

    let summary = format!(
        "submitted={} rejected={} skipped={} duplicate={}",
        count(ReplicaStatus::Submitted),
        rejected,
        count(ReplicaStatus::Skipped),
        count(ReplicaStatus::Duplicate)
    );

    if rejected > 0 {
        warn!(event_id = %event_id, outcome = %summary, "Master event replicated with rejections");
    } else {
        info!(event_id = %event_id, outcome = %summary, "Master event replicated");
    }
}

/// Runtime control of a running engine. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    dispatcher: Arc<Dispatcher>,
    dedup: Arc<DedupLedger>,
    monitor: Option<SourceMonitor>,
    state: Arc<RunState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControlHandle {
    pub fn get_status(&self) -> EngineStatus {
        EngineStatus {
            running: self.state.running.load(Ordering::SeqCst),
            dry_run: self.state.dry_run,
            uptime: self.state.started_at.elapsed(),
            events_received: self.state.events_received.load(Ordering::Relaxed),
            registry_version: self.dispatcher.registry().version(),
            dedup_entries: self.dedup.len(),
            budget: self.dispatcher.budget().status(),
            source: self.monitor.as_ref().map(|m| m.status()),
            followers: self.dispatcher.follower_status(),
        }
    }

    /// Enable or disable a follower for events dispatched from now on.
    pub fn enable_follower(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.dispatcher.registry().set_enabled(id, enabled)?;
        info!(follower = %id, enabled, "Follower toggled");
        Ok(())
    }

    pub fn set_copy_ratio(&self, id: &str, ratio: Decimal) -> Result<(), RegistryError> {
        self.dispatcher.registry().set_copy_ratio(id, ratio)?;
        info!(follower = %id, ratio = %ratio, "Copy ratio updated");
        Ok(())
    }

    /// Disable every follower. Work already queued still completes.
    pub fn emergency_stop_all(&self) -> usize {
        let disabled = self.dispatcher.registry().disable_all();
        warn!(disabled, "Emergency stop: all followers disabled");
        disabled
    }

    /// Force a follower's breaker closed. Returns false for unknown ids.
    pub fn reset_breaker(&self, id: &str) -> bool {
        match self.dispatcher.breaker(id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Ask the engine to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Point-in-time engine status.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub dry_run: bool,
    pub uptime: Duration,
    pub events_received: u64,
    pub registry_version: u64,
    pub dedup_entries: usize,
    pub budget: BudgetStatus,
    pub source: Option<SourceStatus>,
    pub followers: Vec<FollowerStatus>,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Status ===")?;
        writeln!(
            f,
            "Status:          {} {}",
            if self.running { "Running" } else { "Stopped" },
            if self.dry_run { "(Dry Run)" } else { "" }
        )?;
        writeln!(f, "Uptime:          {}s", self.uptime.as_secs())?;
        writeln!(f, "Events:          {}", self.events_received)?;
        if let Some(source) = &self.source {
            writeln!(
                f,
                "Stream:          {} (sessions {}, malformed {})",
                if source.connected { "connected" } else { "disconnected" },
                source.sessions,
                source.frames_malformed
            )?;
        }
        writeln!(
            f,
            "Rate Budget:     {}/{} remaining",
            self.budget.remaining, self.budget.capacity
        )?;
        writeln!(f, "Dedup Entries:   {}", self.dedup_entries)?;

        writeln!(f, "\n{:<16} {:<9} {:>8} {:<10} {:>6} {:>6} {:>6} {:>6} {:>6}",
            "FOLLOWER", "ENABLED", "RATIO", "BREAKER", "SUB", "REJ", "SKIP", "DUP", "QUEUE")?;
        for fl in &self.followers {
            writeln!(
                f,
                "{:<16} {:<9} {:>8} {:<10} {:>6} {:>6} {:>6} {:>6} {:>6}",
                fl.id,
                if fl.enabled { "yes" } else { "no" },
                fl.copy_ratio,
                fl.breaker.state.as_str(),
                fl.submitted,
                fl.rejected,
                fl.skipped,
                fl.duplicate,
                fl.queue_depth
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExchangeError;
    use crate::testing::{MockExchange, Session};
    use rust_decimal_macros::dec;

    const CONFIG: &str = r#"
        database_url = "sqlite::memory:"

        [master]
        api_key = "master"
        api_secret = "master-secret"

        [[followers]]
        id = "a"
        api_key = "key-a"
        api_secret = "secret-a"
        copy_ratio = "0.5"

        [[followers]]
        id = "b"
        api_key = "key-b"
        api_secret = "secret-b"
        copy_ratio = "0.1"

        [[followers]]
        id = "c"
        api_key = "key-c"
        api_secret = "secret-c"
        copy_ratio = "1"
        enabled = false

        [stream]
        initial_backoff_ms = 10
        max_backoff_secs = 1

        [dedup]
        prune_interval_secs = 1
    "#;

    fn fill(order_id: i64, trade_id: i64) -> String {
        format!(
            r#"{{"e":"ORDER_TRADE_UPDATE","E":1700000000000,"T":1700000000000,
            "o":{{"s":"BTCUSDT","c":"m1","S":"BUY","o":"MARKET","x":"TRADE","X":"FILLED",
            "i":{},"l":"1.0","L":"50000","T":1700000000000,"t":{},"R":false,"ps":"BOTH"}}}}"#,
            order_id, trade_id
        )
    }

    async fn engine(exchange: Arc<MockExchange>) -> (Engine, Arc<Database>) {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        config.validate().unwrap();
        let db = Arc::new(Database::new(&config.database_url).await.unwrap());
        (Engine::new(&config, exchange, db.clone(), false), db)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_end_to_end_fan_out() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_session(Session::FramesThenIdle(vec![fill(1, 1)]));

        let (mut engine, db) = engine(exchange.clone()).await;
        let control = engine.control();
        let handle = tokio::spawn(async move { engine.run().await });

        wait_until(|| exchange.submissions().len() == 2).await;
        assert!(control.get_status().running);

        control.shutdown();
        handle.await.unwrap().unwrap();

        let a = exchange.submissions_for("key-a");
        let b = exchange.submissions_for("key-b");
        assert_eq!(a[0].quantity, dec!(0.500));
        assert_eq!(b[0].quantity, dec!(0.100));
        assert!(exchange.submissions_for("key-c").is_empty());

        let rows = db.get_recent_replicas(10, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == "submitted"));

        let state = db.get_engine_state().await.unwrap().unwrap();
        assert!(!state.is_running);
        assert_eq!(state.events_received, 1);
        assert!(!control.get_status().running);
    }

    #[tokio::test]
    async fn test_replay_after_reconnect_is_not_resubmitted() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_session(Session::Frames(vec![
            Ok(fill(1, 1)),
            Err(ExchangeError::StreamClosed("reset".into())),
        ]));
        exchange.push_session(Session::FramesThenIdle(vec![fill(1, 1), fill(2, 1)]));

        let (mut engine, db) = engine(exchange.clone()).await;
        let control = engine.control();
        let handle = tokio::spawn(async move { engine.run().await });

        wait_until(|| {
            let status = control.get_status();
            status.followers.iter().map(|f| f.submitted + f.duplicate).sum::<u64>() == 6
        })
        .await;

        let status = control.get_status();
        assert!(status
            .followers
            .iter()
            .filter(|f| f.enabled)
            .all(|f| f.duplicate == 1));
        assert_eq!(status.source.unwrap().sessions, 2);

        control.shutdown();
        handle.await.unwrap().unwrap();

        // Two distinct fills, two followers each
        assert_eq!(exchange.submissions().len(), 4);

        let counts = db.get_status_counts().await.unwrap();
        assert_eq!(counts.get("submitted"), Some(&4));
        assert_eq!(counts.get("duplicate"), Some(&2));
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_new_events() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, db) = engine(exchange.clone()).await;
        let control = engine.control();

        assert_eq!(control.emergency_stop_all(), 2);
        exchange.push_session(Session::FramesThenIdle(vec![fill(3, 1)]));

        let handle = tokio::spawn(async move { engine.run().await });
        wait_until(|| control.get_status().events_received == 1).await;
        control.shutdown();
        handle.await.unwrap().unwrap();

        assert!(exchange.submissions().is_empty());
        assert!(db.get_recent_replicas(10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_control_operations() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, _db) = engine(exchange).await;
        let control = engine.control();

        assert!(control.set_copy_ratio("a", dec!(0.25)).is_ok());
        assert!(matches!(
            control.set_copy_ratio("a", Decimal::ZERO),
            Err(RegistryError::InvalidRatio(_))
        ));
        assert!(matches!(
            control.enable_follower("zed", true),
            Err(RegistryError::UnknownFollower(_))
        ));
        control.enable_follower("c", true).unwrap();

        assert!(control.reset_breaker("a"));
        assert!(!control.reset_breaker("zed"));

        let status = control.get_status();
        assert!(!status.running);
        assert_eq!(status.followers.len(), 3);
        assert_eq!(status.budget.capacity, 1920);

        let a = status.followers.iter().find(|f| f.id == "a").unwrap();
        assert_eq!(a.copy_ratio, dec!(0.25));
        assert!(status.followers.iter().all(|f| f.enabled));

        let text = status.to_string();
        assert!(text.contains("Stopped"));
        assert!(text.contains("1920/1920"));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, _db) = engine(exchange).await;
        let control = engine.control();

        control.shutdown();
        engine.run().await.unwrap();
        assert!(engine.run().await.is_err());
    }

    #[tokio::test]
    async fn test_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (mut engine, _db) = engine(Arc::new(MockExchange::new())).await;
        let run = engine.run();
        assert_send(&run);
    }
}
