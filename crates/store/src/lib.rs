//! rollwatch store: the local cache mirroring one watched resource collection.
//!
//! The cache is pure storage plus a synchronization gate. Event sources are
//! the only writers; the dispatcher and tools read through [`LocalCache::get`]
//! and wait on [`LocalCache::subscribe_synced`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rollwatch_core::{ChangeEvent, FnvShardPlanner, ResourceIdentity, ResourceSnapshot, ShardPlanner, SharedSnapshot};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, info};

type Shard = RwLock<FxHashMap<ResourceIdentity, SharedSnapshot>>;

pub const DEFAULT_SHARDS: usize = 16;

/// Identity-keyed mirror of the watched collection.
///
/// Each shard has its own lock, so a reader only ever waits on writers of
/// the same shard, and never for longer than one entry update.
pub struct LocalCache {
    shards: Box<[Shard]>,
    planner: FnvShardPlanner,
    len: AtomicUsize,
    epoch: AtomicU64,
    synced_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .field("epoch", &self.epoch())
            .field("synced", &self.all_synced())
            .finish()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl LocalCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_shards(shards: usize) -> Self {
        let planner = FnvShardPlanner::new(shards);
        let shards = (0..planner.buckets()).map(|_| RwLock::new(FxHashMap::default())).collect();
        let (synced_tx, _) = watch::channel(false);
        Self { shards, planner, len: AtomicUsize::new(0), epoch: AtomicU64::new(0), synced_tx }
    }

    fn read_shard(&self, identity: &ResourceIdentity) -> RwLockReadGuard<'_, FxHashMap<ResourceIdentity, SharedSnapshot>> {
        let shard = &self.shards[self.planner.plan(identity)];
        shard.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_shard(&self, identity: &ResourceIdentity) -> RwLockWriteGuard<'_, FxHashMap<ResourceIdentity, SharedSnapshot>> {
        let shard = &self.shards[self.planner.plan(identity)];
        shard.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite. Returns the replaced snapshot, if any.
    pub fn put(&self, identity: ResourceIdentity, snapshot: SharedSnapshot) -> Option<SharedSnapshot> {
        let prev = {
            let mut shard = self.write_shard(&identity);
            let prev = shard.insert(identity, snapshot);
            // Counted under the shard lock so `len` never runs behind a remove of the same key.
            if prev.is_none() {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
            prev
        };
        self.bump();
        metrics::counter!("cache_put_total", 1u64);
        prev
    }

    /// Remove an entry. Removing an absent identity is a no-op.
    pub fn remove(&self, identity: &ResourceIdentity) -> Option<SharedSnapshot> {
        let prev = {
            let mut shard = self.write_shard(identity);
            let prev = shard.remove(identity);
            if prev.is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
            prev
        };
        if prev.is_some() {
            self.bump();
            metrics::counter!("cache_remove_total", 1u64);
        } else {
            debug!(identity = %identity, "remove of absent identity ignored");
        }
        prev
    }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<SharedSnapshot> {
        self.read_shard(identity).get(identity).cloned()
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.read_shard(identity).contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutation counter; increases on every put and every effective remove.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("cache_objects", self.len() as f64);
    }

    /// All identities, sorted. Each shard is locked in turn, not all at once.
    pub fn identities(&self) -> Vec<ResourceIdentity> {
        let mut out: Vec<_> = self
            .shards
            .iter()
            .flat_map(|s| s.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect::<Vec<_>>())
            .collect();
        out.sort_unstable();
        out
    }

    /// All snapshots, sorted by identity.
    pub fn list(&self) -> Vec<SharedSnapshot> {
        let mut out: Vec<_> = self
            .shards
            .iter()
            .flat_map(|s| s.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect::<Vec<_>>())
            .collect();
        out.sort_unstable_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    // ---- sync gate ----

    pub fn all_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Open the gate. Only the first call has an effect.
    pub fn mark_synced(&self) {
        if self.synced_tx.send_if_modified(|v| !std::mem::replace(v, true)) {
            info!(objects = self.len(), "cache synced");
        }
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    // ---- event folding ----

    /// Classify and store one observed object: ADD if new, UPDATE otherwise.
    pub fn observe(&self, snapshot: ResourceSnapshot) -> ChangeEvent {
        let identity = snapshot.identity.clone();
        let new = Arc::new(snapshot);
        match self.put(identity, new.clone()) {
            None => ChangeEvent::added(new),
            Some(old) => ChangeEvent::updated(old, new),
        }
    }

    /// Record a deletion. The event carries the last cached state, if any.
    pub fn forget(&self, identity: ResourceIdentity) -> ChangeEvent {
        let last = self.remove(&identity);
        ChangeEvent::deleted(identity, last)
    }

    /// Reconcile against a full listing.
    ///
    /// Listed objects are stored (ADD for new identities, UPDATE for changed
    /// ones, nothing for unchanged ones) and cached identities missing from
    /// the listing are removed as DELETE. Returned events are in that order.
    pub fn replace_all(&self, listing: Vec<ResourceSnapshot>) -> Vec<ChangeEvent> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::with_capacity(listing.len());
        for snap in listing {
            seen.insert(snap.identity.clone());
            if let Some(cur) = self.get(&snap.identity) {
                if *cur == snap {
                    continue;
                }
            }
            out.push(self.observe(snap));
        }
        let stale: Vec<_> = self.identities().into_iter().filter(|id| !seen.contains(id)).collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "relist removed stale identities");
        }
        for id in stale {
            out.push(self.forget(id));
        }
        out
    }

    /// Apply an already-classified event.
    pub fn apply(&self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Added { identity, snapshot, .. } => {
                self.put(identity.clone(), snapshot.clone());
            }
            ChangeEvent::Updated { identity, new, .. } => {
                self.put(identity.clone(), new.clone());
            }
            ChangeEvent::Deleted { identity, .. } => {
                self.remove(identity);
            }
        }
    }
}
