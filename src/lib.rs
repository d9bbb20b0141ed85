//! Core peer discovery registry and per-connection wire-protocol worker for a
//! BitTorrent client. Everything else — bencode/metainfo parsing, tracker wire
//! clients, on-disk storage, socket framing, and piece selection strategy —
//! is consumed through the collaborator traits in [`collab`].

mod block;
mod cache;
mod collab;
mod conn_state;
mod message;
mod peer;
mod registry;
mod source;
mod worker;

/// A torrent's 20-byte SHA-1 infohash.
pub type InfoHash = [u8; 20];

pub use block::{BlockRead, PieceBlock, Request, RequestKey, MAX_PENDING_REQUESTS, STALL_TIMEOUT};
pub use cache::{CachedPeer, PeerCache};
pub use collab::{
    BlockConsumer, BlockSupplier, BlockWrite, Connection, IdentityService, LifecycleBinder,
    PieceManager, RequestConsumer, SendFailure, TorrentDescriptor, TorrentMeta, TorrentRegistry,
    TrackerClient, TrackerQueryError, TrackerService,
};
pub use conn_state::ConnState;
pub use message::Message;
pub use peer::{AnnounceKey, Peer, PeerOptions};
pub use registry::{PeerConsumer, PeerRegistry, PeerRegistryConfig};
pub use source::{tracker_peer_source, PeerSource, PeerSourceError, PeerSourceFactory, TrackerPeerSource};
pub use worker::{ConnectionWorker, WorkerError};
