//! Viewer registry: who is watching, at which quality, and since when.
//!
//! Viewers announce themselves with periodic pings. A viewer that stays
//! silent for longer than the TTL is swept. The registry also maintains a
//! per-tier address cache that the fan-out reads on every segment; the
//! cache is regenerated wholesale, never patched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct Viewer {
    pub address: String,
    pub last_seen: Instant,
    pub quality: u32,
}

/// Snapshot of viewer addresses grouped by quality tier.
#[derive(Debug)]
pub struct QualityAddressCache {
    tiers: BTreeMap<u32, Arc<[String]>>,
    all: Arc<[String]>,
}

impl QualityAddressCache {
    pub fn empty() -> Self {
        Self {
            tiers: BTreeMap::new(),
            all: Arc::from(Vec::new()),
        }
    }

    fn build(viewers: &HashMap<String, Viewer>) -> Self {
        let mut tiers: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut all: Vec<String> = Vec::with_capacity(viewers.len());
        for v in viewers.values() {
            tiers.entry(v.quality).or_default().push(v.address.clone());
            all.push(v.address.clone());
        }
        all.sort();
        Self {
            tiers: tiers
                .into_iter()
                .map(|(tier, mut addrs)| {
                    addrs.sort();
                    (tier, addrs.into())
                })
                .collect(),
            all: all.into(),
        }
    }

    /// Addresses at exactly `tier`.
    pub fn tier(&self, tier: u32) -> Option<Arc<[String]>> {
        self.tiers.get(&tier).cloned()
    }

    /// Non-empty tiers in ascending order.
    pub fn tiers(&self) -> impl Iterator<Item = (u32, &Arc<[String]>)> {
        self.tiers.iter().map(|(t, a)| (*t, a))
    }

    pub fn all(&self) -> Arc<[String]> {
        self.all.clone()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

struct Inner {
    viewers: HashMap<String, Viewer>,
    cache: Arc<QualityAddressCache>,
    /// A quality change happened since the last rebuild.
    stale: bool,
}

impl Inner {
    fn rebuild(&mut self) {
        self.cache = Arc::new(QualityAddressCache::build(&self.viewers));
        self.stale = false;
    }
}

pub struct ViewerRegistry {
    inner: RwLock<Inner>,
    default_quality: u32,
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ViewerRegistry {
    pub fn new(default_quality: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                viewers: HashMap::new(),
                cache: Arc::new(QualityAddressCache::empty()),
                stale: false,
            }),
            default_quality,
        }
    }

    /// Register a ping. Returns true the first time an address is seen.
    pub fn add_or_touch(&self, address: &str) -> bool {
        self.add_or_touch_at(address, Instant::now())
    }

    pub fn add_or_touch_at(&self, address: &str, now: Instant) -> bool {
        let mut inner = self.inner.write();
        if let Some(v) = inner.viewers.get_mut(address) {
            v.last_seen = now;
            return false;
        }
        inner.viewers.insert(
            address.to_string(),
            Viewer {
                address: address.to_string(),
                last_seen: now,
                quality: self.default_quality,
            },
        );
        inner.rebuild();
        true
    }

    /// Change a known viewer's tier. Unknown addresses are ignored.
    ///
    /// The tier cache picks up the change at its next read.
    pub fn set_quality(&self, address: &str, tier: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(v) = inner.viewers.get_mut(address) else {
            return false;
        };
        if v.quality != tier {
            v.quality = tier;
            inner.stale = true;
        }
        true
    }

    pub fn remove(&self, address: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.viewers.remove(address).is_none() {
            return false;
        }
        inner.rebuild();
        true
    }

    /// Evict viewers silent for longer than `ttl`. Returns how many left.
    pub fn sweep(&self, ttl: Duration) -> usize {
        self.sweep_at(Instant::now(), ttl)
    }

    pub fn sweep_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.viewers.len();
        inner
            .viewers
            .retain(|_, v| now.saturating_duration_since(v.last_seen) <= ttl);
        let removed = before - inner.viewers.len();
        if removed > 0 {
            inner.rebuild();
        }
        removed
    }

    /// Regenerate the tier cache from the viewer map and return it.
    pub fn rebuild_cache(&self) -> Arc<QualityAddressCache> {
        let mut inner = self.inner.write();
        inner.rebuild();
        inner.cache.clone()
    }

    /// Current tier cache, regenerated first if a quality change is pending.
    pub fn tier_cache(&self) -> Arc<QualityAddressCache> {
        {
            let inner = self.inner.read();
            if !inner.stale {
                return inner.cache.clone();
            }
        }
        self.rebuild_cache()
    }

    /// A quality change is waiting for the next cache read.
    pub fn is_cache_stale(&self) -> bool {
        self.inner.read().stale
    }

    pub fn len(&self) -> usize {
        self.inner.read().viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().viewers.contains_key(address)
    }

    pub fn quality_of(&self, address: &str) -> Option<u32> {
        self.inner.read().viewers.get(address).map(|v| v.quality)
    }

    pub fn last_seen(&self, address: &str) -> Option<Instant> {
        self.inner.read().viewers.get(address).map(|v| v.last_seen)
    }

    pub fn all_addresses(&self) -> Arc<[String]> {
        self.tier_cache().all()
    }
}

/// Periodically evict silent viewers until shutdown.
pub async fn sweeper_loop(
    registry: Arc<ViewerRegistry>,
    ttl: Duration,
    check_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(check_interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("viewer sweeper shutting down");
                return;
            }
            _ = interval.tick() => {
                let removed = registry.sweep(ttl);
                if removed > 0 {
                    tracing::info!(removed, remaining = registry.len(), "viewers left - timeout");
                }
            }
        }
    }
}
