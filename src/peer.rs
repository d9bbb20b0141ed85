use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use url::Url;

/// A bag of independent feature flags observed for a peer. Represented as a
/// single word so a cache entry's mutable slot can be published with one
/// atomic store (see [`crate::CachedPeer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerOptions(u32);

impl PeerOptions {
    pub const NONE: PeerOptions = PeerOptions(0);
    /// Peer announced itself as a seed (has every piece).
    pub const SEED: PeerOptions = PeerOptions(1 << 0);
    /// Peer supports the Fast Extension (BEP 6).
    pub const SUPPORTS_FAST: PeerOptions = PeerOptions(1 << 1);
    /// Peer supports the Extension Protocol (BEP 10).
    pub const SUPPORTS_EXTENDED: PeerOptions = PeerOptions(1 << 2);

    pub fn contains(self, flag: PeerOptions) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> PeerOptions {
        PeerOptions(bits)
    }
}

impl std::ops::BitOr for PeerOptions {
    type Output = PeerOptions;

    fn bitor(self, rhs: PeerOptions) -> PeerOptions {
        PeerOptions(self.0 | rhs.0)
    }
}

/// A remote endpoint identity. Equality and hashing are by `address` only —
/// two `Peer` values observed for the same socket address are the same peer
/// even if one carries a peer-id and the other doesn't.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub options: PeerOptions,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            peer_id: None,
            options: PeerOptions::NONE,
        }
    }

    pub fn with_id(address: SocketAddr, peer_id: [u8; 20]) -> Self {
        Self {
            address,
            peer_id: Some(peer_id),
            options: PeerOptions::NONE,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// A torrent's announce target: a single tracker, or a BEP-12 tiered list of
/// tracker lists. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnnounceKey {
    Single(Url),
    Tiered(Vec<Vec<Url>>),
}

impl AnnounceKey {
    /// All URLs across all tiers, in tier then in-tier order.
    pub fn urls(&self) -> Box<dyn Iterator<Item = &Url> + '_> {
        match self {
            AnnounceKey::Single(url) => Box::new(std::iter::once(url)),
            AnnounceKey::Tiered(tiers) => Box::new(tiers.iter().flatten()),
        }
    }
}
