//! In-memory keeper implementation.
//!
//! [`LocalKeeper`] implements the [`Keeper`] contract over a shared
//! [`ClusterState`]. Several keepers sharing one state simulate a cluster in
//! one process, which is how the integration suites exercise election,
//! dispatch placement, and watchdog rescue.
//!
//! ## Limitations
//!
//! - **Single-process only**: membership is not visible across processes
//! - **No persistence**: the lease and heartbeats die with the process

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_core::parse_worker_number;

use super::{DistributedMutex, Keeper, LockOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, FlowEvent};

/// The leader lease row.
#[derive(Debug, Clone)]
struct LeaderLease {
    worker_key: String,
    updated_at: DateTime<Utc>,
}

/// One held mutex row.
#[derive(Debug, Clone)]
struct MutexRow {
    holder: String,
    expire_at: DateTime<Utc>,
}

/// Shared membership state, the in-memory stand-in for the backend.
///
/// Clone the `Arc` into every [`LocalKeeper`] that should see the same
/// cluster.
#[derive(Debug, Default)]
pub struct ClusterState {
    leader: RwLock<Option<LeaderLease>>,
    heartbeats: DashMap<String, DateTime<Utc>>,
    mutexes: DashMap<String, MutexRow>,
}

/// Options for a [`LocalKeeper`].
#[derive(Debug, Clone)]
pub struct LocalKeeperOptions {
    /// Worker key, `<prefix>-<number>`.
    pub worker_key: String,
    /// Window after which a silent worker counts as dead. Election and
    /// heartbeat cadence is half of it.
    pub unhealthy: Duration,
}

impl LocalKeeperOptions {
    /// Creates options with the default 5 s unhealthy window.
    #[must_use]
    pub fn new(worker_key: impl Into<String>) -> Self {
        Self {
            worker_key: worker_key.into(),
            unhealthy: Duration::from_secs(5),
        }
    }

    /// Sets the unhealthy window.
    #[must_use]
    pub const fn with_unhealthy(mut self, unhealthy: Duration) -> Self {
        self.unhealthy = unhealthy;
        self
    }
}

/// In-memory keeper.
#[derive(Debug)]
pub struct LocalKeeper {
    worker_key: String,
    worker_number: u16,
    unhealthy: chrono::Duration,
    cluster: Arc<ClusterState>,
    bus: EventBus,
    leader_flag: AtomicBool,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalKeeper {
    /// Validates the worker key, performs the first election and heartbeat,
    /// and starts the background loops.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker key is malformed.
    pub fn start(
        options: &LocalKeeperOptions,
        cluster: Arc<ClusterState>,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        let worker_number = parse_worker_number(&options.worker_key)?;
        let unhealthy = chrono::Duration::from_std(options.unhealthy)
            .map_err(|err| Error::storage_with_source("unhealthy window out of range", err))?;

        let keeper = Arc::new(Self {
            worker_key: options.worker_key.clone(),
            worker_number,
            unhealthy,
            cluster,
            bus,
            leader_flag: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        });

        // Election must be settled before the engine wires leader-only
        // components, so the first round runs inline.
        keeper.heartbeat();
        keeper.elect();

        let cadence = options.unhealthy / 2;
        let mut handles = Vec::new();
        for loop_kind in [LoopKind::Elect, LoopKind::Heartbeat] {
            let keeper = Arc::clone(&keeper);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cadence);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = keeper.cancel.cancelled() => break,
                        _ = ticker.tick() => match loop_kind {
                            LoopKind::Elect => keeper.elect(),
                            LoopKind::Heartbeat => keeper.heartbeat(),
                        },
                    }
                }
            }));
        }
        if let Ok(mut guard) = keeper.handles.lock() {
            *guard = handles;
        }

        Ok(keeper)
    }

    fn heartbeat(&self) {
        self.cluster
            .heartbeats
            .insert(self.worker_key.clone(), Utc::now());
    }

    fn elect(&self) {
        if self.leader_flag.load(Ordering::SeqCst) {
            self.continue_leader();
        } else {
            self.campaign();
        }
    }

    fn campaign(&self) {
        let acquired = {
            let Ok(mut leader) = self.cluster.leader.write() else {
                return;
            };
            let now = Utc::now();

            // Take over when the row is absent, ours, or stale.
            let can_acquire = match leader.as_ref() {
                None => true,
                Some(lease) if lease.worker_key == self.worker_key => true,
                Some(lease) => lease.updated_at < now - self.unhealthy,
            };
            if can_acquire {
                *leader = Some(LeaderLease {
                    worker_key: self.worker_key.clone(),
                    updated_at: now,
                });
            }
            can_acquire
        };

        if acquired {
            self.set_leader_flag(true);
        }
    }

    fn continue_leader(&self) {
        let renewed = {
            let Ok(mut leader) = self.cluster.leader.write() else {
                return;
            };
            match leader.as_mut() {
                Some(lease) if lease.worker_key == self.worker_key => {
                    lease.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if !renewed {
            tracing::warn!(worker = %self.worker_key, "re-elected failed");
            self.set_leader_flag(false);
        }
    }

    fn set_leader_flag(&self, is_leader: bool) {
        let was = self.leader_flag.swap(is_leader, Ordering::SeqCst);
        if was != is_leader {
            self.bus.publish(FlowEvent::LeaderChanged {
                is_leader,
                worker_key: self.worker_key.clone(),
            });
        }
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    Elect,
    Heartbeat,
}

#[async_trait]
impl Keeper for LocalKeeper {
    fn is_leader(&self) -> bool {
        self.leader_flag.load(Ordering::SeqCst)
    }

    fn worker_key(&self) -> &str {
        &self.worker_key
    }

    fn worker_number(&self) -> u16 {
        self.worker_number
    }

    async fn alive_nodes(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - self.unhealthy;
        let mut nodes: Vec<String> = self
            .cluster
            .heartbeats
            .iter()
            .filter(|entry| *entry.value() > cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn is_alive(&self, worker_key: &str) -> Result<bool> {
        let cutoff = Utc::now() - self.unhealthy;
        Ok(self
            .cluster
            .heartbeats
            .get(worker_key)
            .is_some_and(|beat| *beat.value() > cutoff))
    }

    fn new_mutex(&self, key: &str) -> Box<dyn DistributedMutex> {
        Box::new(LocalMutex {
            key: key.to_string(),
            cluster: Arc::clone(&self.cluster),
            holder: None,
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handles = self
            .handles
            .lock()
            .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }

        if self.leader_flag.load(Ordering::SeqCst) {
            if let Ok(mut leader) = self.cluster.leader.write() {
                if leader
                    .as_ref()
                    .is_some_and(|lease| lease.worker_key == self.worker_key)
                {
                    *leader = None;
                }
            }
        }
        self.cluster.heartbeats.remove(&self.worker_key);
        self.set_leader_flag(false);
    }
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// In-memory distributed mutex.
struct LocalMutex {
    key: String,
    cluster: Arc<ClusterState>,
    /// Identity written into the row while held.
    holder: Option<String>,
}

impl LocalMutex {
    fn try_acquire(&self, identity: &str, ttl: chrono::Duration) -> bool {
        let now = Utc::now();
        let mut acquired = false;

        self.cluster
            .mutexes
            .entry(self.key.clone())
            .and_modify(|row| {
                if row.expire_at < now || row.holder == identity {
                    row.holder = identity.to_string();
                    row.expire_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                MutexRow {
                    holder: identity.to_string(),
                    expire_at: now + ttl,
                }
            });

        acquired
    }
}

#[async_trait]
impl DistributedMutex for LocalMutex {
    async fn lock(&mut self, options: &LockOptions) -> Result<()> {
        let identity = options.reentrant_identity.clone().unwrap_or_else(|| {
            format!("mutex-{}", HOLDER_SEQ.fetch_add(1, Ordering::SeqCst))
        });
        let ttl = chrono::Duration::from_std(options.ttl)
            .map_err(|err| Error::storage_with_source("mutex ttl out of range", err))?;

        let deadline = tokio::time::Instant::now() + options.wait_timeout;
        loop {
            if self.try_acquire(&identity, ttl) {
                self.holder = Some(identity);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::MutexLockTimeout {
                    key: self.key.clone(),
                });
            }
            tokio::time::sleep(options.spin_interval).await;
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        let Some(holder) = self.holder.take() else {
            return Err(Error::MutexAlreadyUnlocked {
                key: self.key.clone(),
            });
        };

        let removed = self
            .cluster
            .mutexes
            .remove_if(&self.key, |_, row| row.holder == holder);
        if removed.is_none() {
            return Err(Error::MutexAlreadyUnlocked {
                key: self.key.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(key: &str) -> LocalKeeperOptions {
        LocalKeeperOptions::new(key).with_unhealthy(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn first_keeper_becomes_leader() {
        let cluster = Arc::new(ClusterState::default());
        let keeper = LocalKeeper::start(&options("worker-1"), cluster, EventBus::new()).unwrap();
        assert!(keeper.is_leader());
        assert_eq!(keeper.worker_number(), 1);
        keeper.close().await;
    }

    #[tokio::test]
    async fn at_most_one_leader() {
        let cluster = Arc::new(ClusterState::default());
        let bus = EventBus::new();
        let k1 = LocalKeeper::start(&options("worker-1"), Arc::clone(&cluster), bus.clone())
            .unwrap();
        let k2 = LocalKeeper::start(&options("worker-2"), Arc::clone(&cluster), bus.clone())
            .unwrap();
        let k3 = LocalKeeper::start(&options("worker-3"), cluster, bus).unwrap();

        let leaders = [k1.is_leader(), k2.is_leader(), k3.is_leader()]
            .iter()
            .filter(|l| **l)
            .count();
        assert_eq!(leaders, 1);

        k1.close().await;
        k2.close().await;
        k3.close().await;
    }

    #[tokio::test]
    async fn takeover_after_leader_dies() {
        let cluster = Arc::new(ClusterState::default());
        let bus = EventBus::new();
        let k1 = LocalKeeper::start(&options("worker-1"), Arc::clone(&cluster), bus.clone())
            .unwrap();
        assert!(k1.is_leader());

        // Simulate death: stop loops without releasing the lease.
        k1.cancel.cancel();

        let k2 = LocalKeeper::start(&options("worker-2"), Arc::clone(&cluster), bus).unwrap();
        assert!(!k2.is_leader());

        // Once the lease goes stale, the next election round takes over.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(k2.is_leader());

        k2.close().await;
    }

    #[tokio::test]
    async fn alive_nodes_tracks_heartbeats() {
        let cluster = Arc::new(ClusterState::default());
        let bus = EventBus::new();
        let k1 = LocalKeeper::start(&options("worker-1"), Arc::clone(&cluster), bus.clone())
            .unwrap();
        let k2 = LocalKeeper::start(&options("worker-2"), Arc::clone(&cluster), bus).unwrap();

        let nodes = k1.alive_nodes().await.unwrap();
        assert_eq!(nodes, vec!["worker-1".to_string(), "worker-2".to_string()]);
        assert!(k1.is_alive("worker-2").await.unwrap());

        k2.close().await;
        assert!(!k1.is_alive("worker-2").await.unwrap());

        k1.close().await;
    }

    #[tokio::test]
    async fn leader_change_is_published() {
        let cluster = Arc::new(ClusterState::default());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let keeper = LocalKeeper::start(&options("worker-1"), cluster, bus).unwrap();
        match rx.recv().await.unwrap() {
            FlowEvent::LeaderChanged {
                is_leader,
                worker_key,
            } => {
                assert!(is_leader);
                assert_eq!(worker_key, "worker-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        keeper.close().await;
    }

    #[tokio::test]
    async fn rejects_malformed_worker_key() {
        let cluster = Arc::new(ClusterState::default());
        assert!(LocalKeeper::start(
            &LocalKeeperOptions::new("no-number-suffix-"),
            cluster,
            EventBus::new()
        )
        .is_err());
    }

    #[tokio::test]
    async fn mutex_excludes_second_holder() {
        let cluster = Arc::new(ClusterState::default());
        let bus = EventBus::new();
        let k1 = LocalKeeper::start(&options("worker-1"), Arc::clone(&cluster), bus.clone())
            .unwrap();
        let k2 = LocalKeeper::start(&options("worker-2"), cluster, bus).unwrap();

        let opts = LockOptions::default()
            .with_wait_timeout(Duration::from_millis(100))
            .with_spin_interval(Duration::from_millis(10));

        let mut m1 = k1.new_mutex("migrate");
        let mut m2 = k2.new_mutex("migrate");

        m1.lock(&opts).await.unwrap();
        assert!(matches!(
            m2.lock(&opts).await,
            Err(Error::MutexLockTimeout { .. })
        ));

        m1.unlock().await.unwrap();
        m2.lock(&opts).await.unwrap();
        m2.unlock().await.unwrap();

        k1.close().await;
        k2.close().await;
    }

    #[tokio::test]
    async fn mutex_reentrant_identity_reacquires() {
        let cluster = Arc::new(ClusterState::default());
        let keeper =
            LocalKeeper::start(&options("worker-1"), cluster, EventBus::new()).unwrap();

        let opts = LockOptions::default()
            .with_reentrant_identity("job-42")
            .with_wait_timeout(Duration::from_millis(100));

        let mut first = keeper.new_mutex("migrate");
        first.lock(&opts).await.unwrap();

        let mut second = keeper.new_mutex("migrate");
        second.lock(&opts).await.unwrap();

        keeper.close().await;
    }

    #[tokio::test]
    async fn mutex_expired_row_can_be_taken() {
        let cluster = Arc::new(ClusterState::default());
        let keeper =
            LocalKeeper::start(&options("worker-1"), Arc::clone(&cluster), EventBus::new())
                .unwrap();

        let short = LockOptions::default()
            .with_ttl(Duration::from_millis(20))
            .with_wait_timeout(Duration::from_millis(100));
        let mut m1 = keeper.new_mutex("migrate");
        m1.lock(&short).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut m2 = keeper.new_mutex("migrate");
        m2.lock(&LockOptions::default().with_wait_timeout(Duration::from_millis(100)))
            .await
            .unwrap();

        keeper.close().await;
    }

    #[tokio::test]
    async fn unlock_without_lock_errors() {
        let cluster = Arc::new(ClusterState::default());
        let keeper =
            LocalKeeper::start(&options("worker-1"), cluster, EventBus::new()).unwrap();

        let mut mutex = keeper.new_mutex("migrate");
        assert!(matches!(
            mutex.unlock().await,
            Err(Error::MutexAlreadyUnlocked { .. })
        ));
        keeper.close().await;
    }
}
