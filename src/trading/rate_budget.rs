//! Shared request-weight budget for all outbound exchange calls.
//!
//! The exchange enforces a per-minute weight limit across the whole IP, so
//! every follower draws from one budget. The budget is a sliding-window log
//! of granted weights; it never sleeps while holding its lock, and callers
//! are told how long to wait instead.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("request weight {weight} exceeds budget capacity {capacity}")]
    WeightExceedsCapacity { weight: u32, capacity: u32 },
}

/// Result of a budget request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Enough weight ages out of the window after this long
    Wait(Duration),
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub capacity: u32,
    pub used: u32,
    pub remaining: u32,
    pub utilization: f64,
    pub total_requests: u64,
    pub total_weight: u64,
    pub total_waits: u64,
}

struct BudgetState {
    /// Granted (time, weight) pairs inside the window, oldest first
    log: VecDeque<(Instant, u32)>,
    used: u32,
    total_requests: u64,
    total_weight: u64,
    total_waits: u64,
}

impl BudgetState {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, weight)) = self.log.front() {
            if now.saturating_duration_since(at) >= window {
                self.log.pop_front();
                self.used -= weight;
            } else {
                break;
            }
        }
    }

    fn push(&mut self, now: Instant, weight: u32) {
        self.log.push_back((now, weight));
        self.used += weight;
    }
}

/// Sliding-window rate budget.
pub struct RateBudget {
    capacity: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

impl RateBudget {
    /// Budget of `floor(weight_limit * safety_margin)` per `window`.
    pub fn new(weight_limit: u32, safety_margin: f64, window: Duration) -> Self {
        let capacity = (weight_limit as f64 * safety_margin.clamp(0.0, 1.0)).floor() as u32;
        Self::with_capacity(capacity, window)
    }

    pub fn with_capacity(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new(BudgetState {
                log: VecDeque::new(),
                used: 0,
                total_requests: 0,
                total_weight: 0,
                total_waits: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn acquire(&self, weight: u32) -> Result<Acquire, BudgetError> {
        self.acquire_at(weight, Instant::now())
    }

    /// Grant `weight` now, or report the minimum wait until it fits.
    pub fn acquire_at(&self, weight: u32, now: Instant) -> Result<Acquire, BudgetError> {
        if weight > self.capacity {
            return Err(BudgetError::WeightExceedsCapacity {
                weight,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock();
        state.evict(now, self.window);

        if state.used + weight <= self.capacity {
            state.push(now, weight);
            state.total_requests += 1;
            state.total_weight += weight as u64;
            return Ok(Acquire::Granted);
        }

        // Oldest entries expire first; find the one whose expiry frees enough.
        let needed = state.used + weight - self.capacity;
        let mut freed = 0;
        let mut wait = self.window;
        for &(at, w) in state.log.iter() {
            freed += w;
            if freed >= needed {
                wait = (at + self.window).saturating_duration_since(now);
                break;
            }
        }

        state.total_waits += 1;
        Ok(Acquire::Wait(wait.max(Duration::from_millis(1))))
    }

    /// Acquire `weight`, sleeping as instructed until it is granted.
    pub async fn acquire_wait(&self, weight: u32) -> Result<(), BudgetError> {
        loop {
            match self.acquire(weight)? {
                Acquire::Granted => return Ok(()),
                Acquire::Wait(d) => {
                    debug!(weight, wait_ms = d.as_millis() as u64, "Rate budget exhausted, waiting");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    pub fn exhaust(&self) {
        self.exhaust_at(Instant::now())
    }

    /// Consume everything left in the current window.
    pub fn exhaust_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.evict(now, self.window);
        let remaining = self.capacity.saturating_sub(state.used);
        if remaining > 0 {
            state.push(now, remaining);
        }
        warn!(capacity = self.capacity, "Rate budget exhausted by exchange rate limit");
    }

    pub fn sync_used_weight(&self, server_used: u32) {
        self.sync_used_weight_at(server_used, Instant::now())
    }

    /// Align with the exchange's own count when it is ahead of ours.
    pub fn sync_used_weight_at(&self, server_used: u32, now: Instant) {
        let mut state = self.state.lock();
        state.evict(now, self.window);
        if server_used > state.used {
            let extra = (server_used - state.used).min(self.capacity.saturating_sub(state.used));
            if extra > 0 {
                debug!(server_used, local_used = state.used, "Syncing rate budget with exchange");
                state.push(now, extra);
            }
        }
    }

    pub fn status(&self) -> BudgetStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> BudgetStatus {
        let mut state = self.state.lock();
        state.evict(now, self.window);
        let remaining = self.capacity.saturating_sub(state.used);
        BudgetStatus {
            capacity: self.capacity,
            used: state.used,
            remaining,
            utilization: if self.capacity == 0 {
                0.0
            } else {
                state.used as f64 / self.capacity as f64
            },
            total_requests: state.total_requests,
            total_weight: state.total_weight,
            total_waits: state.total_waits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_capacity_applies_safety_margin() {
        let budget = RateBudget::new(2400, 0.8, MINUTE);
        assert_eq!(budget.capacity(), 1920);

        let budget = RateBudget::new(1199, 0.5, MINUTE);
        assert_eq!(budget.capacity(), 599);
    }

    #[test]
    fn test_grants_until_capacity_then_waits() {
        let budget = RateBudget::with_capacity(10, MINUTE);
        let t0 = Instant::now();

        assert_eq!(budget.acquire_at(4, t0).unwrap(), Acquire::Granted);
        assert_eq!(
            budget.acquire_at(6, t0 + Duration::from_secs(10)).unwrap(),
            Acquire::Granted
        );

        // Needs 1 more; the first entry (weight 4) expires at t0 + 60s.
        let now = t0 + Duration::from_secs(20);
        assert_eq!(
            budget.acquire_at(1, now).unwrap(),
            Acquire::Wait(Duration::from_secs(40))
        );

        // Needs 5 more; both entries must expire, the second at t0 + 70s.
        assert_eq!(
            budget.acquire_at(5, now).unwrap(),
            Acquire::Wait(Duration::from_secs(50))
        );

        assert_eq!(
            budget.acquire_at(4, t0 + MINUTE).unwrap(),
            Acquire::Granted
        );
        assert_eq!(budget.status_at(t0 + MINUTE).total_waits, 2);
    }

    #[test]
    fn test_weight_above_capacity_is_an_error() {
        let budget = RateBudget::with_capacity(10, MINUTE);
        assert_eq!(
            budget.acquire(11),
            Err(BudgetError::WeightExceedsCapacity {
                weight: 11,
                capacity: 10
            })
        );
    }

    #[test]
    fn test_exhaust_blocks_until_window_passes() {
        let budget = RateBudget::with_capacity(10, MINUTE);
        let t0 = Instant::now();
        budget.acquire_at(3, t0).unwrap();
        budget.exhaust_at(t0 + Duration::from_secs(1));

        assert_eq!(budget.status_at(t0 + Duration::from_secs(1)).remaining, 0);
        assert!(matches!(
            budget.acquire_at(1, t0 + Duration::from_secs(2)).unwrap(),
            Acquire::Wait(_)
        ));
        assert_eq!(
            budget.acquire_at(10, t0 + Duration::from_secs(61)).unwrap(),
            Acquire::Granted
        );
    }

    #[test]
    fn test_sync_used_weight_only_moves_up() {
        let budget = RateBudget::with_capacity(100, MINUTE);
        let t0 = Instant::now();
        budget.acquire_at(10, t0).unwrap();

        budget.sync_used_weight_at(5, t0);
        assert_eq!(budget.status_at(t0).used, 10);

        budget.sync_used_weight_at(40, t0);
        assert_eq!(budget.status_at(t0).used, 40);

        budget.sync_used_weight_at(500, t0);
        assert_eq!(budget.status_at(t0).used, 100);
    }

    #[test]
    fn test_concurrent_grants_never_exceed_capacity() {
        let budget = Arc::new(RateBudget::with_capacity(50, MINUTE));
        let granted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                let granted = granted.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if budget.acquire(1).unwrap() == Acquire::Granted {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 50);
        assert_eq!(budget.status().used, 50);
    }

    #[tokio::test]
    async fn test_acquire_wait_sleeps_until_granted() {
        let budget = RateBudget::with_capacity(2, Duration::from_millis(50));
        budget.acquire_wait(2).await.unwrap();

        let start = Instant::now();
        budget.acquire_wait(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
