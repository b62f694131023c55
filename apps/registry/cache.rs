use crate::content::{ProposalContent, ProposalStatus};
use crate::registry::RegistryRecord;
use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
const DEFAULT_GC_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Record,
    Content,
    List,
}

/// Cache identity: entity kind, entity id, and the registry it came
/// from. The list has no id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub qci: Option<u64>,
    pub registry: Option<Address>,
}

impl CacheKey {
    pub fn record(qci: u64, registry: Option<Address>) -> Self {
        Self {
            kind: EntityKind::Record,
            qci: Some(qci),
            registry,
        }
    }

    pub fn content(qci: u64, registry: Option<Address>) -> Self {
        Self {
            kind: EntityKind::Content,
            qci: Some(qci),
            registry,
        }
    }

    pub fn list(registry: Option<Address>) -> Self {
        Self {
            kind: EntityKind::List,
            qci: None,
            registry,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    Record(RegistryRecord),
    Content(ProposalContent),
    List(Vec<RegistryRecord>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    stale: bool,
    stale_at: Instant,
    gc_at: Instant,
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Updated(CacheKey),
    Invalidated(CacheKey),
    Cleared,
}

/// Process-wide client cache for proposal state. One instance is owned
/// by the application context and passed by reference to every reader;
/// only the sync layer's write paths (and the explicit `clear`
/// operator action) invalidate entries. The one sanctioned exception is
/// the optimistic list patch, which always flows through
/// [`ProposalCache::patch_list_status`] / [`ProposalCache::restore_list`].
pub struct ProposalCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    events: broadcast::Sender<CacheEvent>,
    stale_after: Duration,
    gc_after: Duration,
}

impl ProposalCache {
    pub fn new() -> Self {
        Self::with_policy(DEFAULT_STALE_AFTER, DEFAULT_GC_AFTER)
    }

    pub fn with_policy(stale_after: Duration, gc_after: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            stale_after,
            gc_after,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn insert(&self, key: CacheKey, value: CachedValue) {
        let now = Instant::now();
        self.entries.lock().unwrap().insert(
            key,
            CacheEntry {
                value,
                stale: false,
                stale_at: now + self.stale_after,
                gc_at: now + self.gc_after,
            },
        );
        let _ = self.events.send(CacheEvent::Updated(key));
    }

    /// Returns the cached value and whether it is stale. Stale values
    /// are still served; callers decide whether to re-fetch.
    pub fn get(&self, key: &CacheKey) -> Option<(CachedValue, bool)> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        let stale = entry.stale || Instant::now() >= entry.stale_at;
        Some((entry.value.clone(), stale))
    }

    pub fn get_fresh(&self, key: &CacheKey) -> Option<CachedValue> {
        match self.get(key) {
            Some((value, false)) => Some(value),
            _ => None,
        }
    }

    pub fn mark_stale(&self, key: &CacheKey) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.stale = true;
            let _ = self.events.send(CacheEvent::Invalidated(*key));
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        if self.entries.lock().unwrap().remove(key).is_some() {
            let _ = self.events.send(CacheEvent::Invalidated(*key));
        }
    }

    /// Invalidates the whole cluster for one proposal: record and
    /// content are dropped outright, the list is marked stale. Patching
    /// entries in place has historically diverged from chain truth, so
    /// the write paths always go through here.
    pub fn invalidate_proposal(&self, qci: u64, registry: Option<Address>) {
        debug!(qci, "invalidating cache cluster");
        self.remove(&CacheKey::record(qci, registry));
        self.remove(&CacheKey::content(qci, registry));
        self.mark_stale(&CacheKey::list(registry));
    }

    /// Operator escape hatch.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        let _ = self.events.send(CacheEvent::Cleared);
    }

    /// Drops entries past their gc deadline. Returns how many were
    /// collected.
    pub fn gc(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.gc_at);
        before - entries.len()
    }

    /// Pre-operation snapshot of the list, for optimistic rollback.
    pub fn snapshot_list(&self, registry: Option<Address>) -> Option<Vec<RegistryRecord>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&CacheKey::list(registry)) {
            Some(CacheEntry {
                value: CachedValue::List(records),
                ..
            }) => Some(records.clone()),
            _ => None,
        }
    }

    /// Optimistically patches the cached list to show `status` for one
    /// proposal, returning the pre-patch snapshot. The optimistic value
    /// is provisional: the settle step re-fetches from the source of
    /// truth.
    pub fn patch_list_status(
        &self,
        registry: Option<Address>,
        qci: u64,
        status: ProposalStatus,
    ) -> Option<Vec<RegistryRecord>> {
        let key = CacheKey::list(registry);
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(&key)?;
            let CachedValue::List(records) = &mut entry.value else {
                return None;
            };
            let snapshot = records.clone();
            for record in records.iter_mut() {
                if record.qci == qci {
                    record.status = status;
                }
            }
            snapshot
        };
        let _ = self.events.send(CacheEvent::Updated(key));
        Some(snapshot)
    }

    /// Restores a list snapshot taken before an optimistic patch.
    pub fn restore_list(&self, registry: Option<Address>, snapshot: Vec<RegistryRecord>) {
        let key = CacheKey::list(registry);
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&key) {
                entry.value = CachedValue::List(snapshot);
            }
        }
        let _ = self.events.send(CacheEvent::Updated(key));
    }
}

impl Default for ProposalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn record(qci: u64, status: ProposalStatus) -> RegistryRecord {
        RegistryRecord {
            qci,
            content_hash: B256::ZERO,
            ipfs_url: format!("ipfs://Qm{qci}"),
            status,
            version: 1,
            author: Address::ZERO,
            snapshot_id: None,
        }
    }

    #[test]
    fn cluster_invalidation_drops_record_and_content_and_stales_list() {
        let cache = ProposalCache::new();
        cache.insert(
            CacheKey::record(1, None),
            CachedValue::Record(record(1, ProposalStatus::Draft)),
        );
        cache.insert(
            CacheKey::list(None),
            CachedValue::List(vec![record(1, ProposalStatus::Draft)]),
        );

        cache.invalidate_proposal(1, None);

        assert!(cache.get(&CacheKey::record(1, None)).is_none());
        assert!(cache.get(&CacheKey::content(1, None)).is_none());
        let (_, stale) = cache.get(&CacheKey::list(None)).unwrap();
        assert!(stale);
    }

    #[test]
    fn optimistic_patch_and_rollback() {
        let cache = ProposalCache::new();
        cache.insert(
            CacheKey::list(None),
            CachedValue::List(vec![
                record(1, ProposalStatus::Draft),
                record(2, ProposalStatus::Approved),
            ]),
        );

        let snapshot = cache
            .patch_list_status(None, 1, ProposalStatus::ReadyForSnapshot)
            .unwrap();
        assert_eq!(snapshot[0].status, ProposalStatus::Draft);

        let (CachedValue::List(patched), _) = cache.get(&CacheKey::list(None)).unwrap() else {
            panic!("expected list");
        };
        assert_eq!(patched[0].status, ProposalStatus::ReadyForSnapshot);
        assert_eq!(patched[1].status, ProposalStatus::Approved);

        cache.restore_list(None, snapshot);
        let (CachedValue::List(restored), _) = cache.get(&CacheKey::list(None)).unwrap() else {
            panic!("expected list");
        };
        assert_eq!(restored[0].status, ProposalStatus::Draft);
    }

    #[test]
    fn patch_without_cached_list_is_a_noop() {
        let cache = ProposalCache::new();
        assert!(cache
            .patch_list_status(None, 1, ProposalStatus::Approved)
            .is_none());
    }

    #[test]
    fn entries_go_stale_by_policy() {
        let cache = ProposalCache::with_policy(Duration::ZERO, Duration::from_secs(60));
        cache.insert(
            CacheKey::record(1, None),
            CachedValue::Record(record(1, ProposalStatus::Draft)),
        );
        let (_, stale) = cache.get(&CacheKey::record(1, None)).unwrap();
        assert!(stale);
        assert!(cache.get_fresh(&CacheKey::record(1, None)).is_none());
    }

    #[test]
    fn gc_collects_expired_entries() {
        let cache = ProposalCache::with_policy(Duration::ZERO, Duration::ZERO);
        cache.insert(
            CacheKey::record(1, None),
            CachedValue::Record(record(1, ProposalStatus::Draft)),
        );
        assert_eq!(cache.gc(), 1);
        assert!(cache.get(&CacheKey::record(1, None)).is_none());
    }

    #[test]
    fn subscribers_observe_invalidation_events() {
        let cache = ProposalCache::new();
        let mut events = cache.subscribe();
        cache.insert(
            CacheKey::record(1, None),
            CachedValue::Record(record(1, ProposalStatus::Draft)),
        );
        cache.invalidate_proposal(1, None);

        assert!(matches!(
            events.try_recv().unwrap(),
            CacheEvent::Updated(_)
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            CacheEvent::Invalidated(_)
        ));
    }

    #[test]
    fn registry_scoping_keeps_clusters_separate() {
        let cache = ProposalCache::new();
        let a = Some(Address::repeat_byte(0xaa));
        let b = Some(Address::repeat_byte(0xbb));
        cache.insert(
            CacheKey::record(1, a),
            CachedValue::Record(record(1, ProposalStatus::Draft)),
        );
        cache.insert(
            CacheKey::record(1, b),
            CachedValue::Record(record(1, ProposalStatus::Approved)),
        );

        cache.invalidate_proposal(1, a);

        assert!(cache.get(&CacheKey::record(1, a)).is_none());
        assert!(cache.get(&CacheKey::record(1, b)).is_some());
    }
}
