//! External collaborator contracts. None of these are implemented by this
//! crate — the embedding client supplies them. They exist here purely as
//! trait boundaries so `PeerRegistry` and `ConnectionWorker` can be built
//! and tested against the core's actual dependencies.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::{
    block::{PieceBlock, Request},
    message::Message,
    peer::{AnnounceKey, Peer},
    InfoHash,
};

#[derive(thiserror::Error, Debug)]
#[error("tracker query failed: {0}")]
pub struct TrackerQueryError(pub String);

#[derive(thiserror::Error, Debug)]
#[error("failed to post message to peer: {0}")]
pub struct SendFailure(pub String);

/// A torrent's activity status, as tracked by the embedding client.
#[derive(Debug, Clone, Copy)]
pub struct TorrentDescriptor {
    pub is_active: bool,
}

/// The subset of a torrent's metainfo the registry needs to drive discovery.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub announce_key: Option<AnnounceKey>,
    pub is_private: bool,
}

/// Lookup of torrent descriptors and metadata by infohash. Implemented by
/// whatever owns torrent lifecycle in the embedding client.
pub trait TorrentRegistry: Send + Sync {
    fn get_descriptor(&self, id: InfoHash) -> Option<TorrentDescriptor>;
    fn get_torrent(&self, id: InfoHash) -> Option<TorrentMeta>;
}

/// One tracker wire-protocol session, already bound to a specific announce
/// target. The actual HTTP/UDP exchange is out of scope for this core.
#[async_trait]
pub trait TrackerClient: Send {
    async fn announce(&mut self) -> Result<Vec<Peer>, TrackerQueryError>;
}

/// Knows which tracker URL schemes this client can speak, and how to build a
/// [`TrackerClient`] for a given announce key.
pub trait TrackerService: Send + Sync {
    fn is_supported_protocol(&self, url: &url::Url) -> bool;
    fn make_client(&self, key: &AnnounceKey) -> Box<dyn TrackerClient>;
}

/// Source of this client's own 20-byte peer-id.
pub trait IdentityService: Send + Sync {
    fn local_peer_id(&self) -> [u8; 20];
}

/// Registers hooks to run at process boot and at shutdown. The registry uses
/// this to start and stop its discovery loop without owning a runtime handle
/// itself.
pub trait LifecycleBinder {
    fn on_startup(&mut self, hook: Box<dyn FnOnce() + Send>);
    fn on_shutdown(&mut self, hook: Box<dyn FnOnce() + Send>);
}

/// The piece-selection strategy (rarest-first, sequential, etc.) and
/// per-piece completion bookkeeping. Shared by every worker for a torrent;
/// `conn` identifies which connection is asking, not which piece manager to
/// use — there is exactly one `PieceManager` per torrent.
#[async_trait]
pub trait PieceManager: Send + Sync {
    async fn have_any_data(&self) -> bool;
    async fn get_bitfield(&self) -> Vec<u8>;
    async fn peer_has_bitfield(&self, conn: SocketAddr, bitfield: &[u8]);
    async fn peer_has_piece(&self, conn: SocketAddr, idx: u32);
    async fn might_select_piece_for_peer(&self, conn: SocketAddr) -> bool;
    async fn select_piece_for_peer(&self, conn: SocketAddr) -> Option<u32>;
    async fn build_requests_for_piece(&self, idx: u32) -> Vec<Request>;
    async fn check_piece_completed(&self, idx: u32) -> bool;
}

/// The non-blocking half of one peer's transport. Framing/encoding lives
/// below this trait, out of scope for the core.
pub trait Connection: Send {
    /// Read at most one already-framed message, if one is available now.
    /// Must not block.
    fn read_message_now(&mut self) -> Option<Message>;
    /// Buffer `msg` for sending; returns once it's queued, not once it's on
    /// the wire.
    fn post_message(&mut self, msg: Message) -> Result<(), SendFailure>;
    fn is_closed(&self) -> bool;
    fn remote_peer(&self) -> Peer;
}

/// Handles an inbound REQUEST we are not choking the peer for.
pub trait RequestConsumer: Send {
    fn consume(&mut self, request: Request);
}

/// Hands off an inbound PIECE for writeback; returns a handle to track that
/// write's progress.
pub trait BlockConsumer: Send {
    fn consume(&mut self, piece: PieceBlock) -> Box<dyn BlockWrite>;
}

/// Polls for blocks we owe to peers, once their reads from storage complete.
pub trait BlockSupplier: Send {
    fn poll(&mut self) -> Option<crate::block::BlockRead>;
}

/// A handle to an in-progress (or finished) disk write for one block.
pub trait BlockWrite: Send + std::fmt::Debug {
    fn is_complete(&self) -> bool;
    fn is_success(&self) -> bool;
}
