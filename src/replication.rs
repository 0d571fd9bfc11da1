//! Replication hook. A primary always appends to its own redo log the same
//! way regardless of durability mode; the mode only gates whether — and how
//! long — the committing thread waits for a replica to acknowledge the
//! position it just wrote.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::DurabilityMode;
use crate::error::{Error, Result};

pub trait ReplicationManager: Send + Sync {
    /// Replicas reject local writes (spec `Error::UnmodifiableReplica`).
    fn is_replica(&self) -> bool {
        false
    }

    /// Blocks (per `mode`) until `position` is known durable on enough
    /// replicas, or returns `Error::ConfirmationFailure` on timeout.
    fn confirm(&self, position: u64, mode: DurabilityMode) -> Result<()>;

    /// The highest redo position this member has durably applied, used by
    /// a replica to report its own progress to a primary.
    fn applied_position(&self) -> u64 {
        0
    }
}

/// No replication configured; every commit is immediately "confirmed".
pub struct NoopReplicationManager;

impl ReplicationManager for NoopReplicationManager {
    fn confirm(&self, _position: u64, _mode: DurabilityMode) -> Result<()> {
        Ok(())
    }
}

/// A same-process stand-in for a real replica link: a primary tracks the
/// position it has written, a paired replica calls `advance` as it
/// "receives" records, and `confirm` waits for the replica to catch up.
/// Good enough to exercise the confirmation-timeout path in tests without
/// a real network.
pub struct InMemoryReplicationManager {
    confirmed_position: AtomicU64,
    is_replica: bool,
    confirm_timeout: Duration,
}

impl InMemoryReplicationManager {
    pub fn primary(confirm_timeout: Duration) -> InMemoryReplicationManager {
        InMemoryReplicationManager { confirmed_position: AtomicU64::new(0), is_replica: false, confirm_timeout }
    }

    pub fn replica() -> InMemoryReplicationManager {
        InMemoryReplicationManager { confirmed_position: AtomicU64::new(0), is_replica: true, confirm_timeout: Duration::ZERO }
    }

    /// Simulates the replica side acknowledging up to `position`.
    pub fn advance(&self, position: u64) {
        self.confirmed_position.fetch_max(position, Ordering::AcqRel);
    }
}

impl ReplicationManager for InMemoryReplicationManager {
    fn is_replica(&self) -> bool {
        self.is_replica
    }

    fn confirm(&self, position: u64, mode: DurabilityMode) -> Result<()> {
        if self.is_replica {
            return Err(Error::UnmodifiableReplica);
        }
        if mode != DurabilityMode::Sync {
            return Ok(());
        }
        let deadline = Instant::now() + self.confirm_timeout;
        loop {
            if self.confirmed_position.load(Ordering::Acquire) >= position {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ConfirmationFailure { position });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn applied_position(&self) -> u64 {
        self.confirmed_position.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sync_modes_never_wait() {
        let mgr = InMemoryReplicationManager::primary(Duration::from_millis(5));
        mgr.confirm(1000, DurabilityMode::NoSync).unwrap();
    }

    #[test]
    fn sync_mode_times_out_without_an_ack() {
        let mgr = InMemoryReplicationManager::primary(Duration::from_millis(5));
        assert!(matches!(mgr.confirm(1000, DurabilityMode::Sync), Err(Error::ConfirmationFailure { position: 1000 })));
    }

    #[test]
    fn sync_mode_succeeds_once_advanced() {
        let mgr = InMemoryReplicationManager::primary(Duration::from_millis(200));
        mgr.advance(1000);
        mgr.confirm(1000, DurabilityMode::Sync).unwrap();
    }

    #[test]
    fn replica_rejects_local_writes() {
        let mgr = InMemoryReplicationManager::replica();
        assert!(matches!(mgr.confirm(1, DurabilityMode::Sync), Err(Error::UnmodifiableReplica)));
    }
}
