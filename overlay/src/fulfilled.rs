//! Fulfilled-request cache
//!
//! Remembers "we asked X of peer P" / "peer P asked X of us" with an expiry
//! so abusable requests (list sync, payment sync, verification, sporks) are
//! never repeated inside their window. Peers that re-ask before expiry are
//! subject to misbehavior scoring by the callers.

use meridian_core::Clock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default time a fulfilled request stays on record
pub const FULFILLED_TTL_SECONDS: i64 = 60 * 60;

pub struct FulfilledRequestCache {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<SocketAddr, HashMap<String, i64>>>,
}

impl FulfilledRequestCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fulfilled request with the default TTL
    pub async fn mark(&self, peer: SocketAddr, tag: &str) {
        self.mark_for(peer, tag, FULFILLED_TTL_SECONDS).await;
    }

    pub async fn mark_for(&self, peer: SocketAddr, tag: &str, ttl: i64) {
        let expires = self.clock.now() + ttl;
        let mut entries = self.entries.write().await;
        entries
            .entry(peer)
            .or_default()
            .insert(tag.to_string(), expires);
    }

    /// Whether an unexpired record exists
    pub async fn has(&self, peer: SocketAddr, tag: &str) -> bool {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(&peer)
            .and_then(|tags| tags.get(tag))
            .map(|expires| *expires > now)
            .unwrap_or(false)
    }

    pub async fn clear(&self, peer: SocketAddr, tag: &str) {
        let mut entries = self.entries.write().await;
        if let Some(tags) = entries.get_mut(&peer) {
            tags.remove(tag);
            if tags.is_empty() {
                entries.remove(&peer);
            }
        }
    }

    /// Drop the given tags for every known peer (used on sync restart)
    pub async fn clear_tags(&self, tags: &[&str]) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, peer_tags| {
            for tag in tags {
                peer_tags.remove(*tag);
            }
            !peer_tags.is_empty()
        });
    }

    /// Drop expired records
    pub async fn purge_expired(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, tags| {
            tags.retain(|_, expires| *expires > now);
            !tags.is_empty()
        });
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(|t| t.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ManualClock;

    fn peer(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:29100").parse().unwrap()
    }

    #[tokio::test]
    async fn mark_and_expire() {
        let clock = Arc::new(ManualClock::new(1000));
        let cache = FulfilledRequestCache::new(clock.clone());

        cache.mark(peer(1), "dseg").await;
        assert!(cache.has(peer(1), "dseg").await);
        assert!(!cache.has(peer(2), "dseg").await);
        assert!(!cache.has(peer(1), "spork-sync").await);

        clock.advance(FULFILLED_TTL_SECONDS + 1);
        assert!(!cache.has(peer(1), "dseg").await);

        cache.purge_expired().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn clear_tags_hits_every_peer() {
        let clock = Arc::new(ManualClock::new(1000));
        let cache = FulfilledRequestCache::new(clock);
        cache.mark(peer(1), "spork-sync").await;
        cache.mark(peer(2), "spork-sync").await;
        cache.mark(peer(2), "dseg").await;

        cache.clear_tags(&["spork-sync"]).await;
        assert!(!cache.has(peer(1), "spork-sync").await);
        assert!(!cache.has(peer(2), "spork-sync").await);
        assert!(cache.has(peer(2), "dseg").await);
    }

    #[tokio::test]
    async fn clear_single_entry() {
        let clock = Arc::new(ManualClock::new(1000));
        let cache = FulfilledRequestCache::new(clock);
        cache.mark(peer(1), "mnverify-request").await;
        cache.clear(peer(1), "mnverify-request").await;
        assert!(!cache.has(peer(1), "mnverify-request").await);
        assert_eq!(cache.len().await, 0);
    }
}
