//! Application configuration.
//!
//! Loaded from a TOML file. API keys left empty in the file are taken from
//! the environment (`.env` is honored):
//!
//! - `COPIER_MASTER_API_KEY` / `COPIER_MASTER_API_SECRET`
//! - `COPIER_FOLLOWER_<ID>_API_KEY` / `COPIER_FOLLOWER_<ID>_API_SECRET`
//!
//! where `<ID>` is the follower id upper-cased with non-alphanumerics as `_`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::{FUTURES_REST_URL, FUTURES_WS_URL};
use crate::models::{mask_secret, Credentials, FollowerAccount, SymbolRules};
use crate::trading::{BreakerConfig, DedupLedger, DispatcherConfig, RateBudget, SourceConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub ws_url: String,

    /// Timeout applied to every exchange call
    pub request_timeout_secs: u64,

    /// Signed request validity window in milliseconds
    pub recv_window: u64,

    /// Listen key keepalive interval in minutes
    pub keepalive_mins: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: FUTURES_REST_URL.to_string(),
            ws_url: FUTURES_WS_URL.to_string(),
            request_timeout_secs: 10,
            recv_window: 5000,
            keepalive_mins: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerSettings {
    pub id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    pub copy_ratio: Decimal,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-symbol rule overrides, e.g. `[followers.precision.BTCUSDT]`
    #[serde(default)]
    pub precision: HashMap<String, SymbolRules>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Exchange request-weight limit per window
    pub weight_limit: u32,

    /// Fraction of the limit the engine allows itself (0.0 to 1.0]
    pub safety_margin: f64,

    pub window_secs: u64,
    pub order_weight: u32,
    pub rules_weight: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            weight_limit: 2400,
            safety_margin: 0.8,
            window_secs: 60,
            order_weight: 1,
            rules_weight: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub retention_hours: u64,
    pub max_entries: usize,
    pub prune_interval_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            max_entries: 100_000,
            prune_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Replicate limit fills as market orders
    pub force_market_orders: bool,
    pub transient_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            force_market_orders: true,
            transient_retries: 1,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_secs: 60,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub master: MasterSettings,
    #[serde(default)]
    pub followers: Vec<FollowerSettings>,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

pub const DEFAULT_DATABASE_URL: &str = "sqlite:copier.db?mode=rwc";

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

impl AppConfig {
    /// Load, fill secrets from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Fill empty credentials using `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fill(&mut self.master.api_key, &lookup, "COPIER_MASTER_API_KEY");
        fill(&mut self.master.api_secret, &lookup, "COPIER_MASTER_API_SECRET");

        for follower in &mut self.followers {
            let prefix = format!("COPIER_FOLLOWER_{}", env_id(&follower.id));
            fill(&mut follower.api_key, &lookup, &format!("{}_API_KEY", prefix));
            fill(&mut follower.api_secret, &lookup, &format!("{}_API_SECRET", prefix));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.master_credentials().is_complete() {
            bail!("Master API key and secret are required");
        }
        if self.followers.is_empty() {
            bail!("At least one follower must be configured");
        }

        let mut seen = HashSet::new();
        for f in &self.followers {
            if f.id.trim().is_empty() {
                bail!("Follower id must not be empty");
            }
            if !seen.insert(f.id.as_str()) {
                bail!("Duplicate follower id {}", f.id);
            }
            if f.copy_ratio <= Decimal::ZERO {
                bail!("Follower {} copy_ratio must be > 0, got {}", f.id, f.copy_ratio);
            }
            if f.api_key.is_empty() || f.api_secret.is_empty() {
                bail!("Follower {} is missing API credentials", f.id);
            }
            for (symbol, rules) in &f.precision {
                if !rules.is_valid() {
                    bail!("Follower {} has invalid precision for {}", f.id, symbol);
                }
            }
        }

        let rl = &self.rate_limit;
        if !(rl.safety_margin > 0.0 && rl.safety_margin <= 1.0) {
            bail!("rate_limit.safety_margin must be in (0, 1], got {}", rl.safety_margin);
        }
        if self.rate_budget().capacity() == 0 {
            bail!("Rate budget capacity is zero");
        }
        if rl.window_secs == 0 {
            bail!("rate_limit.window_secs must be > 0");
        }
        let heaviest = rl.order_weight.max(rl.rules_weight);
        if rl.order_weight == 0 || heaviest > self.rate_budget().capacity() {
            bail!("rate_limit weights must be between 1 and the budget capacity");
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker thresholds must be > 0");
        }
        if self.dedup.max_entries == 0 {
            bail!("dedup.max_entries must be > 0");
        }

        Ok(())
    }

    pub fn master_credentials(&self) -> Credentials {
        Credentials::new(&self.master.api_key, &self.master.api_secret)
    }

    pub fn follower_accounts(&self) -> Vec<FollowerAccount> {
        self.followers
            .iter()
            .map(|f| {
                let mut account = FollowerAccount::new(
                    &f.id,
                    Credentials::new(&f.api_key, &f.api_secret),
                    f.copy_ratio,
                );
                account.enabled = f.enabled;
                account.precision = f.precision.clone();
                account
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.request_timeout_secs)
    }

    pub fn rate_budget(&self) -> RateBudget {
        RateBudget::new(
            self.rate_limit.weight_limit,
            self.rate_limit.safety_margin,
            Duration::from_secs(self.rate_limit.window_secs),
        )
    }

    pub fn dedup_ledger(&self) -> DedupLedger {
        DedupLedger::new(
            Duration::from_secs(self.dedup.retention_hours * 3600),
            self.dedup.max_entries,
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: self.request_timeout(),
            order_weight: self.rate_limit.order_weight,
            rules_weight: self.rate_limit.rules_weight,
            transient_retries: self.dispatch.transient_retries,
            retry_delay: Duration::from_millis(self.dispatch.retry_delay_ms),
            force_market_orders: self.dispatch.force_market_orders,
            breaker: BreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
                success_threshold: self.circuit_breaker.success_threshold,
            },
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            initial_backoff: Duration::from_millis(self.stream.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.stream.max_backoff_secs),
            channel_capacity: self.stream.channel_capacity,
        }
    }

    /// Configuration as text with every secret masked.
    pub fn redacted(&self) -> Redacted<'_> {
        Redacted(self)
    }
}

fn fill(slot: &mut String, lookup: &impl Fn(&str) -> Option<String>, name: &str) {
    if slot.is_empty() {
        if let Some(value) = lookup(name) {
            *slot = value;
        }
    }
}

fn env_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub struct Redacted<'a>(&'a AppConfig);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0;

        writeln!(f, "=== Exchange ===")?;
        writeln!(f, "  REST URL:            {}", c.exchange.rest_url)?;
        writeln!(f, "  Stream URL:          {}", c.exchange.ws_url)?;
        writeln!(f, "  Request Timeout:     {}s", c.exchange.request_timeout_secs)?;
        writeln!(f, "  Recv Window:         {}ms", c.exchange.recv_window)?;

        writeln!(f, "\n=== Master ===")?;
        writeln!(f, "  API Key:             {}", mask_secret(&c.master.api_key))?;
        writeln!(f, "  API Secret:          {}", mask_secret(&c.master.api_secret))?;

        writeln!(f, "\n=== Followers ({}) ===", c.followers.len())?;
        for fl in &c.followers {
            writeln!(
                f,
                "  {:<16} ratio {:<8} {:<8} key {}",
                fl.id,
                fl.copy_ratio,
                if fl.enabled { "enabled" } else { "disabled" },
                mask_secret(&fl.api_key)
            )?;
            let mut symbols: Vec<&String> = fl.precision.keys().collect();
            symbols.sort();
            for symbol in symbols {
                let r = &fl.precision[symbol];
                writeln!(
                    f,
                    "    {} step {} tick {} min notional {}",
                    symbol, r.quantity_step, r.price_tick, r.min_notional
                )?;
            }
        }

        let budget = c.rate_budget();
        writeln!(f, "\n=== Rate Limit ===")?;
        writeln!(
            f,
            "  Weight Limit:        {} per {}s (margin {}, capacity {})",
            c.rate_limit.weight_limit,
            c.rate_limit.window_secs,
            c.rate_limit.safety_margin,
            budget.capacity()
        )?;
        writeln!(f, "  Order Weight:        {}", c.rate_limit.order_weight)?;

        writeln!(f, "\n=== Circuit Breaker ===")?;
        writeln!(f, "  Failure Threshold:   {}", c.circuit_breaker.failure_threshold)?;
        writeln!(f, "  Reset Timeout:       {}s", c.circuit_breaker.reset_timeout_secs)?;
        writeln!(f, "  Success Threshold:   {}", c.circuit_breaker.success_threshold)?;

        writeln!(f, "\n=== Dedup ===")?;
        writeln!(f, "  Retention:           {}h", c.dedup.retention_hours)?;
        writeln!(f, "  Max Entries:         {}", c.dedup.max_entries)?;

        writeln!(f, "\n=== Dispatch ===")?;
        writeln!(f, "  Force Market:        {}", c.dispatch.force_market_orders)?;
        writeln!(f, "  Transient Retries:   {}", c.dispatch.transient_retries)?;

        write!(f, "\nDatabase: {}", c.database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
        database_url = "sqlite::memory:"

        [master]
        api_key = "masterkey123"

        [[followers]]
        id = "alice"
        api_key = "alicekey99"
        api_secret = "alicesecret"
        copy_ratio = "0.5"

        [followers.precision.BTCUSDT]
        quantity_step = "0.01"
        price_tick = "0.5"
        min_notional = "5"

        [[followers]]
        id = "bob-2"
        copy_ratio = "0.1"
        enabled = false

        [rate_limit]
        weight_limit = 1200
    "#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn loaded() -> AppConfig {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.apply_env(env(&[
            ("COPIER_MASTER_API_KEY", "ignored"),
            ("COPIER_MASTER_API_SECRET", "mastersecret"),
            ("COPIER_FOLLOWER_BOB_2_API_KEY", "bobkey"),
            ("COPIER_FOLLOWER_BOB_2_API_SECRET", "bobsecret"),
        ]));
        config
    }

    #[test]
    fn test_defaults_and_overrides() {
        let config = loaded();
        assert_eq!(config.rate_limit.weight_limit, 1200);
        assert_eq!(config.rate_budget().capacity(), 960);
        assert_eq!(config.dedup.retention_hours, 24);
        assert_eq!(config.exchange.rest_url, FUTURES_REST_URL);
        assert!(config.dispatch.force_market_orders);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_fills_only_missing_secrets() {
        let config = loaded();
        assert_eq!(config.master.api_key, "masterkey123");
        assert_eq!(config.master.api_secret, "mastersecret");
        assert_eq!(config.followers[1].api_key, "bobkey");
    }

    #[test]
    fn test_follower_accounts() {
        let accounts = loaded().follower_accounts();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].copy_ratio, dec!(0.5));
        assert_eq!(accounts[0].rules_for("BTCUSDT").unwrap().quantity_step, dec!(0.01));
        assert!(!accounts[1].enabled);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = loaded();
        config.followers[0].copy_ratio = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.followers[1].id = "alice".into();
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.master.api_secret.clear();
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.rate_limit.weight_limit = 1;
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.followers[0]
            .precision
            .get_mut("BTCUSDT")
            .unwrap()
            .quantity_step = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let text = loaded().redacted().to_string();
        assert!(text.contains("ma***23"));
        assert!(text.contains("al***99"));
        assert!(!text.contains("mastersecret"));
        assert!(!text.contains("alicekey99"));
        assert!(text.contains("capacity 960"));
    }
}
