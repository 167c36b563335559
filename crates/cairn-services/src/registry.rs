//! Remote peer registry — the most recent view of the LAN.
//!
//! Keyed injectively by the announcement's source `(IPv4, port)` address;
//! `SocketAddrV4`'s ordering (address first, then port) makes iteration
//! reproducible. Eviction runs against the receiver's monotonic clock
//! stamped at upsert, so a peer advertising a future wall-clock time
//! cannot outlive its TTL; the sender timestamp is kept for logging only.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// One resource as advertised by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub name: String,
    pub size: u64,
}

/// Everything known about one peer, replaced wholesale on every valid
/// announcement.
#[derive(Debug, Clone)]
pub struct PeerView {
    /// Resources in announcement order.
    pub resources: Vec<RemoteResource>,
    /// Sender wall clock from the announcement, nanoseconds since epoch.
    pub announced_at_ns: u64,
    /// Receiver monotonic instant of the accepting upsert. Drives eviction.
    pub last_seen: Instant,
}

/// Thread-safe registry of remote peers. Cheap to clone — clones share
/// the same underlying index.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RwLock<BTreeMap<SocketAddrV4, PeerView>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the view for `addr` atomically. Readers see either the
    /// prior view or the new one, never a partial resource list.
    pub fn upsert(&self, addr: SocketAddrV4, resources: Vec<RemoteResource>, announced_at_ns: u64) {
        let view = PeerView {
            resources,
            announced_at_ns,
            last_seen: Instant::now(),
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, view);
    }

    /// Does `addr` currently advertise `name`?
    pub fn has(&self, addr: SocketAddrV4, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .is_some_and(|view| view.resources.iter().any(|r| r.name == name))
    }

    /// Every peer advertising `name`, in address order.
    pub fn find_nodes_with(&self, name: &str) -> Vec<SocketAddrV4> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, view)| view.resources.iter().any(|r| r.name == name))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Flatten the registry into `(peer, resource)` pairs, in address
    /// order and then announcement order.
    pub fn all(&self) -> Vec<(SocketAddrV4, RemoteResource)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(addr, view)| {
                view.resources
                    .iter()
                    .map(move |resource| (*addr, resource.clone()))
            })
            .collect()
    }

    /// Evict every peer whose last accepted announcement is at least
    /// `ttl` old. Returns how many were removed.
    pub fn cleanup(&self, ttl: Duration) -> usize {
        let mut nodes = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = nodes.len();
        nodes.retain(|addr, view| {
            let stale = view.last_seen.elapsed() >= ttl;
            if stale {
                tracing::debug!(
                    peer = %addr,
                    sender_clock_ns = view.announced_at_ns,
                    "evicting stale peer"
                );
            }
            !stale
        });
        before - nodes.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
