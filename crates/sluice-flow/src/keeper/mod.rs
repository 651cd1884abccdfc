//! Cluster membership and leader election.
//!
//! The [`Keeper`] trait is the membership contract the scheduling pipeline
//! consumes: a stable worker identity, the set of live workers, a
//! cluster-wide leader flag, and best-effort distributed mutexes.
//!
//! ## Required semantics (backend independent)
//!
//! - **At most one leader** at any time, enforced by compare-and-swap on a
//!   leader row keyed by a constant id, with an `updated_at` heartbeat
//!   renewed at `unhealthy / 2` cadence; takeover is only permitted once the
//!   row is older than `unhealthy`.
//! - **Heartbeats** renewed at the same cadence; rows expire so dead workers
//!   disappear from [`Keeper::alive_nodes`] within the unhealthy window plus
//!   backend GC lag.
//! - [`crate::events::FlowEvent::LeaderChanged`] published on every flip.
//!
//! The pipeline tolerates false negatives on `alive_nodes` (eventual
//! consistency) but relies on at-most-one-leader for dispatcher safety.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Options for acquiring a distributed mutex.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long the lock is held before it expires on its own.
    pub ttl: Duration,
    /// Optional identity that may re-acquire the lock while holding it.
    pub reentrant_identity: Option<String>,
    /// How often acquisition retries while the lock is held elsewhere.
    pub spin_interval: Duration,
    /// How long acquisition spins before giving up.
    pub wait_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            reentrant_identity: None,
            spin_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(5),
        }
    }
}

impl LockOptions {
    /// Sets the lock TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the reentrant identity.
    #[must_use]
    pub fn with_reentrant_identity(mut self, identity: impl Into<String>) -> Self {
        self.reentrant_identity = Some(identity.into());
        self
    }

    /// Sets the spin interval.
    #[must_use]
    pub const fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    /// Sets the acquisition deadline.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Best-effort cross-worker lock with TTL and optional reentrancy.
///
/// Acquisition CAS-inserts a row of `(key, expire_at, identity)`; an existing
/// expired row may be CAS-replaced, and an existing row whose identity equals
/// the caller's reentrant identity succeeds immediately. Acquisition spins at
/// the configured interval until the wait deadline.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Acquires the lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::MutexLockTimeout`] when the deadline
    /// elapses first.
    async fn lock(&mut self, options: &LockOptions) -> Result<()>;

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::MutexAlreadyUnlocked`] when the caller
    /// does not hold it.
    async fn unlock(&mut self) -> Result<()>;
}

/// Cluster membership contract.
#[async_trait]
pub trait Keeper: Send + Sync {
    /// True while this worker holds the leader lease.
    fn is_leader(&self) -> bool;

    /// This worker's stable identity (`<prefix>-<number>` unless a custom id
    /// minter is installed).
    fn worker_key(&self) -> &str;

    /// The numeric suffix of the worker key, seeding the id generator.
    fn worker_number(&self) -> u16;

    /// Keys of workers whose heartbeat is within the unhealthy window.
    async fn alive_nodes(&self) -> Result<Vec<String>>;

    /// True if the given worker's heartbeat is within the unhealthy window.
    async fn is_alive(&self, worker_key: &str) -> Result<bool>;

    /// Creates a distributed mutex handle for the given key.
    fn new_mutex(&self, key: &str) -> Box<dyn DistributedMutex>;

    /// Stops background loops and deregisters this worker.
    async fn close(&self);
}
