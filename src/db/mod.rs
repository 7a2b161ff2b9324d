//! SQLite persistence for the trade record and engine state.
//!
//! Stores:
//! - Master fills as received from the stream
//! - Every replica outcome (submitted, rejected, skipped, duplicate)
//! - Engine run state for the `status` command

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{MasterEvent, ReplicaOrder};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Engine state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EngineStateRow {
    pub is_running: bool,
    pub dry_run: bool,
    pub followers: i64,
    pub events_received: i64,
    pub last_event_at: Option<String>,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub updated_at: String,
}

/// Stored replica outcome.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredReplica {
    pub source_event_id: String,
    pub follower_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub price: String,
    pub order_type: String,
    pub status: String,
    pub reason: Option<String>,
    pub exchange_order_id: Option<String>,
    pub attempts: i64,
    pub created_at: String,
}

/// Aggregate activity over a time window.
#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub master_events: i64,
    pub master_volume: f64,
    pub replicas_by_status: BTreeMap<String, i64>,
    pub replica_volume: f64,
    pub symbols: Vec<String>,
    pub followers: Vec<String>,
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running INTEGER NOT NULL DEFAULT 0,
                dry_run INTEGER NOT NULL DEFAULT 0,
                followers INTEGER NOT NULL DEFAULT 0,
                events_received INTEGER NOT NULL DEFAULT 0,
                last_event_at TEXT,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS master_events (
                event_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                order_type TEXT NOT NULL,
                position_side TEXT NOT NULL DEFAULT 'BOTH',
                reduce_only INTEGER NOT NULL DEFAULT 0,
                event_time TEXT NOT NULL,
                received_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_orders (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                order_type TEXT NOT NULL,
                position_side TEXT NOT NULL DEFAULT 'BOTH',
                reduce_only INTEGER NOT NULL DEFAULT 0,
                client_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                exchange_order_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_master_events_time ON master_events(event_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replica_orders_follower ON replica_orders(follower_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replica_orders_created ON replica_orders(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replica_orders_event ON replica_orders(source_event_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Engine State ====================

    /// Record an engine start.
    pub async fn mark_engine_started(&self, dry_run: bool, followers: usize) -> Result<()> {
        let now = timestamp(&Utc::now());
        sqlx::query(
            r#"
            INSERT INTO engine_state (id, is_running, dry_run, followers, events_received,
                                      started_at, stopped_at, updated_at)
            VALUES (1, 1, ?, ?, 0, ?, NULL, ?)
            ON CONFLICT(id) DO UPDATE SET
                is_running = 1,
                dry_run = excluded.dry_run,
                followers = excluded.followers,
                events_received = 0,
                last_event_at = NULL,
                started_at = excluded.started_at,
                stopped_at = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(dry_run)
        .bind(followers as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update progress counters of the running engine.
    pub async fn update_engine_progress(
        &self,
        events_received: u64,
        last_event_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE engine_state SET
                events_received = ?,
                last_event_at = COALESCE(?, last_event_at),
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(events_received as i64)
        .bind(last_event_at.as_ref().map(timestamp))
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark engine as stopped.
    pub async fn mark_engine_stopped(&self) -> Result<()> {
        let now = timestamp(&Utc::now());
        sqlx::query("UPDATE engine_state SET is_running = 0, stopped_at = ?, updated_at = ? WHERE id = 1")
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Last recorded engine state, if the engine ever ran.
    pub async fn get_engine_state(&self) -> Result<Option<EngineStateRow>> {
        sqlx::query_as::<_, EngineStateRow>("SELECT is_running, dry_run, followers, events_received, last_event_at, \
             started_at, stopped_at, updated_at FROM engine_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch engine state")
    }

    // ==================== Trade Record ====================

    /// Store a master fill. Re-delivered fills are ignored.
    pub async fn insert_master_event(&self, event: &MasterEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO master_events (
                event_id, order_id, symbol, side, quantity, price, order_type,
                position_side, reduce_only, event_time, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.order_id)
        .bind(&event.symbol)
        .bind(event.side.as_str())
        .bind(event.quantity.to_string())
        .bind(event.price.to_string())
        .bind(event.order_type.as_str())
        .bind(event.position_side.as_str())
        .bind(event.reduce_only)
        .bind(timestamp(&event.timestamp))
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a replica outcome.
    pub async fn insert_replica_order(&self, replica: &ReplicaOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replica_orders (
                id, source_event_id, follower_id, symbol, side, quantity, price,
                order_type, position_side, reduce_only, client_order_id, status,
                reason, exchange_order_id, attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&replica.id)
        .bind(&replica.source_event_id)
        .bind(&replica.follower_id)
        .bind(&replica.symbol)
        .bind(replica.side.as_str())
        .bind(replica.quantity.to_string())
        .bind(replica.price.to_string())
        .bind(replica.order_type.as_str())
        .bind(replica.position_side.as_str())
        .bind(replica.reduce_only)
        .bind(&replica.client_order_id)
        .bind(replica.status.as_str())
        .bind(&replica.reason)
        .bind(&replica.exchange_order_id)
        .bind(replica.attempts as i64)
        .bind(timestamp(&replica.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert replica order")?;

        Ok(())
    }

    /// Most recent replica outcomes, newest first.
    pub async fn get_recent_replicas(
        &self,
        limit: i64,
        follower_id: Option<&str>,
    ) -> Result<Vec<StoredReplica>> {
        let base = "SELECT source_event_id, follower_id, symbol, side, quantity, price, \
                    order_type, status, reason, exchange_order_id, attempts, created_at \
                    FROM replica_orders";

        let sql = match follower_id {
            Some(_) => format!("{} WHERE follower_id = ? ORDER BY created_at DESC LIMIT ?", base),
            None => format!("{} ORDER BY created_at DESC LIMIT ?", base),
        };

        let mut query = sqlx::query_as::<_, StoredReplica>(&sql);
        if let Some(id) = follower_id {
            query = query.bind(id);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await;

        rows.context("Failed to fetch replica orders")
    }

    /// Replica counts per status over all time.
    pub async fn get_status_counts(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM replica_orders GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().collect())
    }

    /// Activity in the last `hours` hours.
    pub async fn get_trade_stats(&self, hours: i64) -> Result<TradeStats> {
        let since = timestamp(&(Utc::now() - Duration::hours(hours)));

        let (master_events, master_volume): (i64, f64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CAST(quantity AS REAL) * CAST(price AS REAL)), 0.0)
            FROM master_events WHERE event_time >= ?
            "#,
        )
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM replica_orders WHERE created_at >= ? GROUP BY status",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        let (replica_volume,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(CAST(quantity AS REAL) * CAST(price AS REAL)), 0.0)
            FROM replica_orders WHERE created_at >= ? AND status = 'submitted'
            "#,
        )
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        let symbols: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT symbol FROM master_events WHERE event_time >= ? ORDER BY symbol",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        let followers: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT follower_id FROM replica_orders WHERE created_at >= ? ORDER BY follower_id",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        Ok(TradeStats {
            master_events,
            master_volume,
            replicas_by_status: by_status.into_iter().collect(),
            replica_volume,
            symbols: symbols.into_iter().map(|(s,)| s).collect(),
            followers: followers.into_iter().map(|(f,)| f).collect(),
        })
    }
}
