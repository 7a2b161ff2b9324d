//! Copy-trading core: master feed, per-follower dispatch, and the guards
//! around each submission.

mod circuit_breaker;
mod dedup;
mod dispatcher;
mod master_source;
mod rate_budget;
mod registry;
mod sink;
mod translator;

pub use circuit_breaker::BreakerConfig;
pub use dedup::DedupLedger;
pub use dispatcher::{DispatchTicket, Dispatcher, DispatcherConfig, FollowerStatus};
pub use master_source::{MasterSource, SourceConfig, SourceMonitor, SourceStatus};
pub(crate) use master_source::wait_for_shutdown;
pub use rate_budget::{BudgetStatus, RateBudget};
pub use registry::{FollowerRegistry, RegistryError};
pub use sink::{DbSink, TradeSink};

#[cfg(test)]
pub use sink::TradeRecord;
