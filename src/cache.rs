use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use crate::peer::{Peer, PeerOptions};

/// An interned, canonical record for one peer endpoint. All fields but
/// `options` are frozen at interning time; `options` is replaced in place as
/// fresher observations arrive, so every subsystem holding an `Arc<CachedPeer>`
/// for a given address sees the same object and its latest flags.
#[derive(Debug)]
pub struct CachedPeer {
    pub address: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    options: AtomicU32,
}

impl CachedPeer {
    /// The peer's most recently observed feature flags. A plain acquire load
    /// of a single word — no lock needed, since options are only ever
    /// replaced wholesale, never read-modify-written.
    pub fn options(&self) -> PeerOptions {
        PeerOptions::from_bits(self.options.load(Ordering::Acquire))
    }

    fn publish(&self, options: PeerOptions) {
        self.options.store(options.bits(), Ordering::Release);
    }
}

/// The canonical, deduplicated peer directory. At most one [`CachedPeer`] per
/// socket address exists for the lifetime of the process.
#[derive(Debug, Default)]
pub struct PeerCache {
    entries: Mutex<HashMap<SocketAddr, Arc<CachedPeer>>>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `peer`, or if an entry for its address already exists, replace
    /// that entry's options with `peer.options` and return it unchanged
    /// otherwise. Atomic with respect to `lookup`: the whole read-or-insert
    /// happens under one lock acquisition.
    pub fn register(&self, peer: Peer) -> Arc<CachedPeer> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&peer.address) {
            existing.publish(peer.options);
            return existing.clone();
        }
        let cached = Arc::new(CachedPeer {
            address: peer.address,
            peer_id: peer.peer_id,
            options: AtomicU32::new(peer.options.bits()),
        });
        entries.insert(peer.address, cached.clone());
        cached
    }

    /// Return the cached entry for `address`, creating a minimal one (no
    /// peer-id, default options) if none exists yet.
    pub fn lookup(&self, address: SocketAddr) -> Arc<CachedPeer> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(address)
            .or_insert_with(|| {
                Arc::new(CachedPeer {
                    address,
                    peer_id: None,
                    options: AtomicU32::new(PeerOptions::NONE.bits()),
                })
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
