//! Versioned registry of follower configuration.
//!
//! Writers replace the whole snapshot; readers take an `Arc` to the current
//! one and are never blocked by a writer for longer than the pointer swap.

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use crate::models::FollowerAccount;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown follower: {0}")]
    UnknownFollower(String),

    #[error("copy ratio must be positive, got {0}")]
    InvalidRatio(Decimal),
}

/// Immutable view of all followers at one version.
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub followers: Vec<Arc<FollowerAccount>>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&Arc<FollowerAccount>> {
        self.followers.iter().find(|f| f.id == id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<FollowerAccount>> {
        self.followers.iter().filter(|f| f.enabled)
    }
}

pub struct FollowerRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl FollowerRegistry {
    pub fn new(followers: Vec<FollowerAccount>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot {
                version: 1,
                followers: followers.into_iter().map(Arc::new).collect(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Arc<FollowerAccount>> {
        self.snapshot().get(id).cloned()
    }

    /// Current enabled flag; unknown followers count as disabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.snapshot().get(id).map(|f| f.enabled).unwrap_or(false)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.update(id, |f| f.enabled = enabled)?;
        info!(follower = %id, enabled, "Follower enabled flag changed");
        Ok(())
    }

    pub fn set_copy_ratio(&self, id: &str, ratio: Decimal) -> Result<(), RegistryError> {
        if ratio <= Decimal::ZERO {
            return Err(RegistryError::InvalidRatio(ratio));
        }
        self.update(id, |f| f.copy_ratio = ratio)?;
        info!(follower = %id, ratio = %ratio, "Follower copy ratio changed");
        Ok(())
    }

    /// Disable every follower; returns how many were enabled.
    pub fn disable_all(&self) -> usize {
        let mut current = self.current.write();
        let mut changed = 0;
        let followers = current
            .followers
            .iter()
            .map(|f| {
                if f.enabled {
                    changed += 1;
                    let mut copy = FollowerAccount::clone(f);
                    copy.enabled = false;
                    Arc::new(copy)
                } else {
                    f.clone()
                }
            })
            .collect();

        *current = Arc::new(RegistrySnapshot {
            version: current.version + 1,
            followers,
        });
        changed
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut FollowerAccount),
    ) -> Result<(), RegistryError> {
        let mut current = self.current.write();
        let idx = current
            .followers
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| RegistryError::UnknownFollower(id.to_string()))?;

        let mut followers = current.followers.clone();
        let mut copy = FollowerAccount::clone(&followers[idx]);
        apply(&mut copy);
        followers[idx] = Arc::new(copy);

        *current = Arc::new(RegistrySnapshot {
            version: current.version + 1,
            followers,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credentials;
    use rust_decimal_macros::dec;

    fn registry() -> FollowerRegistry {
        FollowerRegistry::new(vec![
            FollowerAccount::new("a", Credentials::new("ka", "sa"), dec!(0.5)),
            FollowerAccount::new("b", Credentials::new("kb", "sb"), dec!(0.1)),
        ])
    }

    #[test]
    fn test_snapshot_is_isolated_from_updates() {
        let reg = registry();
        let before = reg.snapshot();

        reg.set_enabled("a", false).unwrap();

        assert!(before.get("a").unwrap().enabled);
        assert!(!reg.is_enabled("a"));
        assert_eq!(reg.version(), before.version + 1);
        assert_eq!(reg.snapshot().enabled().count(), 1);
    }

    #[test]
    fn test_copy_ratio_validation() {
        let reg = registry();
        reg.set_copy_ratio("b", dec!(0.2)).unwrap();
        assert_eq!(reg.get("b").unwrap().copy_ratio, dec!(0.2));

        assert_eq!(
            reg.set_copy_ratio("b", dec!(0)),
            Err(RegistryError::InvalidRatio(dec!(0)))
        );
        assert_eq!(
            reg.set_copy_ratio("zzz", dec!(1)),
            Err(RegistryError::UnknownFollower("zzz".into()))
        );
    }

    #[test]
    fn test_disable_all() {
        let reg = registry();
        reg.set_enabled("b", false).unwrap();

        assert_eq!(reg.disable_all(), 1);
        assert_eq!(reg.snapshot().enabled().count(), 0);
        assert!(!reg.is_enabled("unknown"));
    }
}
