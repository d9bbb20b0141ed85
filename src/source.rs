use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{
    collab::{TrackerClient, TrackerService},
    peer::{AnnounceKey, Peer},
    InfoHash,
};

#[derive(thiserror::Error, Debug)]
#[error("peer source error: {0}")]
pub struct PeerSourceError(pub String);

/// A pull-based, rate-limited supplier of candidate peers for one torrent.
#[async_trait]
pub trait PeerSource: Send {
    /// Attempt to refresh the candidate set. `Ok(true)` means fresh peers are
    /// available via `peers()`; `Ok(false)` means rate-limited or unchanged.
    /// Must not block the caller on unbounded I/O.
    async fn update(&mut self) -> Result<bool, PeerSourceError>;
    /// The current candidate snapshot, consumed after a successful `update`.
    fn peers(&self) -> Vec<Peer>;
}

/// Yields a [`PeerSource`] for a given torrent. Concrete adapters (PEX, DHT,
/// ...) are supplied by the embedding client at [`crate::PeerRegistryConfig`]
/// construction time.
pub trait PeerSourceFactory: Send + Sync {
    fn peer_source(&self, torrent_id: InfoHash) -> Box<dyn PeerSource>;
}

/// Wraps a [`TrackerClient`] with a minimum re-announce interval.
pub struct TrackerPeerSource {
    client: Box<dyn TrackerClient>,
    min_interval: Duration,
    last_query: Option<Instant>,
    candidates: Vec<Peer>,
}

impl TrackerPeerSource {
    pub fn new(client: Box<dyn TrackerClient>, min_interval: Duration) -> Self {
        Self {
            client,
            min_interval,
            last_query: None,
            candidates: Vec::new(),
        }
    }
}

#[async_trait]
impl PeerSource for TrackerPeerSource {
    async fn update(&mut self) -> Result<bool, PeerSourceError> {
        if let Some(last) = self.last_query {
            if last.elapsed() < self.min_interval {
                return Ok(false);
            }
        }
        let peers = self
            .client
            .announce()
            .await
            .map_err(|e| PeerSourceError(e.0))?;
        self.last_query = Some(Instant::now());
        self.candidates = peers;
        Ok(true)
    }

    fn peers(&self) -> Vec<Peer> {
        self.candidates.clone()
    }
}

/// Build a tracker-backed peer source for `key`, honoring BEP-12's
/// conservative multi-tier policy: if any URL across any tier is
/// unsupported, no source is created at all, rather than falling back to
/// the supported subset.
pub fn tracker_peer_source(
    tracker_service: &dyn TrackerService,
    key: &AnnounceKey,
    min_interval: Duration,
) -> Option<TrackerPeerSource> {
    if !key.urls().all(|url| tracker_service.is_supported_protocol(url)) {
        return None;
    }
    let client = tracker_service.make_client(key);
    Some(TrackerPeerSource::new(client, min_interval))
}
