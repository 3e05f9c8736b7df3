use crate::core::{CooldownError, ReplicaId, Result, TabletId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{Level, event};

/// Cooldown lease of a tablet: which replica may upload, and under which term.
///
/// `term == 0` means no lease has been granted yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownConf {
    pub term: u64,
    pub cooldown_replica_id: ReplicaId,
}

impl CooldownConf {
    pub fn new(term: u64, cooldown_replica_id: ReplicaId) -> Self {
        Self {
            term,
            cooldown_replica_id,
        }
    }

    pub fn is_authorized(&self, replica_id: ReplicaId) -> bool {
        self.term > 0 && self.cooldown_replica_id == replica_id
    }
}

/// What an update did to the cached lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfUpdate {
    /// Higher term; the lease was replaced.
    Applied,
    /// Same term and same replica; nothing to do.
    Unchanged,
    /// Lower term; delivered out of order and dropped.
    Stale,
}

/// Local mirror of a tablet's cooldown lease.
///
/// Terms only move forward. For a given term the owning replica is fixed;
/// a second owner for the same term is reported as `ConflictingLease` and
/// leaves the cached lease untouched.
pub struct CooldownConflictResolver {
    tablet_id: TabletId,
    replica_id: ReplicaId,
    conf: Mutex<CooldownConf>,
}

impl CooldownConflictResolver {
    pub fn new(tablet_id: TabletId, replica_id: ReplicaId, conf: CooldownConf) -> Self {
        Self {
            tablet_id,
            replica_id,
            conf: Mutex::new(conf),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn current(&self) -> Result<CooldownConf> {
        Ok(*self.conf.lock()?)
    }

    pub fn update(&self, term: u64, cooldown_replica_id: ReplicaId) -> Result<ConfUpdate> {
        let mut conf = self.conf.lock()?;
        if term < conf.term {
            event!(
                Level::DEBUG,
                tablet_id = self.tablet_id,
                term,
                current_term = conf.term,
                "dropping stale cooldown conf"
            );
            return Ok(ConfUpdate::Stale);
        }
        if term == conf.term {
            if cooldown_replica_id == conf.cooldown_replica_id {
                return Ok(ConfUpdate::Unchanged);
            }
            event!(
                Level::ERROR,
                tablet_id = self.tablet_id,
                term,
                current = conf.cooldown_replica_id,
                proposed = cooldown_replica_id,
                "two cooldown owners announced for one term"
            );
            return Err(CooldownError::ConflictingLease {
                tablet_id: self.tablet_id,
                term,
                current: conf.cooldown_replica_id,
                proposed: cooldown_replica_id,
            });
        }
        *conf = CooldownConf::new(term, cooldown_replica_id);
        event!(
            Level::INFO,
            tablet_id = self.tablet_id,
            term,
            cooldown_replica_id,
            "cooldown conf updated"
        );
        Ok(ConfUpdate::Applied)
    }

    pub fn is_authorized(&self) -> Result<bool> {
        Ok(self.current()?.is_authorized(self.replica_id))
    }

    /// Returns the lease this replica holds, or `NotCooldownOwner`.
    pub fn check_authorized(&self) -> Result<CooldownConf> {
        let conf = self.current()?;
        if conf.is_authorized(self.replica_id) {
            Ok(conf)
        } else {
            Err(CooldownError::NotCooldownOwner {
                tablet_id: self.tablet_id,
                replica_id: self.replica_id,
                term: conf.term,
                owner: conf.cooldown_replica_id,
            })
        }
    }

    /// Puts back a lease that was replaced but could not be persisted.
    pub(crate) fn restore(&self, conf: CooldownConf) -> Result<()> {
        *self.conf.lock()? = conf;
        Ok(())
    }

    /// Fencing check before commit: this replica must still hold the lease.
    /// The term may have moved on since `started` as long as the owner is
    /// unchanged; the current lease is returned.
    pub fn check_still_authorized(&self, started: CooldownConf) -> Result<CooldownConf> {
        let conf = self.current()?;
        if conf.is_authorized(self.replica_id) {
            Ok(conf)
        } else {
            Err(CooldownError::LeaseExpired {
                tablet_id: self.tablet_id,
                started_term: started.term,
                current_term: conf.term,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF: ReplicaId = 10009;
    const OTHER: ReplicaId = 111111111;

    fn resolver() -> CooldownConflictResolver {
        CooldownConflictResolver::new(10005, SELF, CooldownConf::default())
    }

    #[test]
    fn test_term_zero_is_never_authorized() {
        let resolver = resolver();
        assert!(!resolver.is_authorized().unwrap());
        assert!(!CooldownConf::new(0, SELF).is_authorized(SELF));
        assert!(matches!(
            resolver.check_authorized(),
            Err(CooldownError::NotCooldownOwner { term: 0, .. })
        ));
    }

    #[test]
    fn test_update_rules() {
        let resolver = resolver();
        assert_eq!(resolver.update(1, OTHER).unwrap(), ConfUpdate::Applied);
        assert!(!resolver.is_authorized().unwrap());

        assert_eq!(resolver.update(1, OTHER).unwrap(), ConfUpdate::Unchanged);
        assert!(matches!(
            resolver.update(1, SELF),
            Err(CooldownError::ConflictingLease { term: 1, current: OTHER, proposed: SELF, .. })
        ));
        assert_eq!(resolver.current().unwrap(), CooldownConf::new(1, OTHER));

        assert_eq!(resolver.update(2, SELF).unwrap(), ConfUpdate::Applied);
        assert!(resolver.is_authorized().unwrap());

        assert_eq!(resolver.update(1, OTHER).unwrap(), ConfUpdate::Stale);
        assert_eq!(resolver.current().unwrap(), CooldownConf::new(2, SELF));
    }

    #[test]
    fn test_latest_term_wins_regardless_of_delivery_order() {
        let updates = [(3, OTHER), (1, SELF), (5, SELF), (2, OTHER), (4, OTHER)];
        let resolver = resolver();
        for (term, replica) in updates {
            let _ = resolver.update(term, replica);
        }
        assert_eq!(resolver.current().unwrap(), CooldownConf::new(5, SELF));
        assert!(resolver.is_authorized().unwrap());
    }

    #[test]
    fn test_fencing_detects_lease_change() {
        let resolver = resolver();
        resolver.update(1, SELF).unwrap();
        let started = resolver.check_authorized().unwrap();
        assert_eq!(resolver.check_still_authorized(started).unwrap(), started);

        resolver.update(2, OTHER).unwrap();
        assert!(matches!(
            resolver.check_still_authorized(started),
            Err(CooldownError::LeaseExpired { started_term: 1, current_term: 2, .. })
        ));
    }

    #[test]
    fn test_fencing_follows_term_bump_to_same_owner() {
        let resolver = resolver();
        resolver.update(1, SELF).unwrap();
        let started = resolver.check_authorized().unwrap();

        resolver.update(3, SELF).unwrap();
        assert_eq!(
            resolver.check_still_authorized(started).unwrap(),
            CooldownConf::new(3, SELF)
        );
    }

    #[test]
    fn test_restore_puts_back_previous_lease() {
        let resolver = resolver();
        resolver.update(1, SELF).unwrap();
        let previous = resolver.current().unwrap();
        resolver.update(2, OTHER).unwrap();

        resolver.restore(previous).unwrap();
        assert_eq!(resolver.current().unwrap(), CooldownConf::new(1, SELF));
        assert!(resolver.is_authorized().unwrap());
    }
}
