use std::time::Duration;

use bytes::Bytes;

/// Upper bound on in-flight requests a worker keeps per connection. The issue
/// loop in `worker.rs` checks `<=` against this rather than `<`, which
/// permits `MAX_PENDING_REQUESTS + 1` in flight at the boundary — kept as-is
/// rather than silently tightened.
pub const MAX_PENDING_REQUESTS: usize = 3;

/// How long a connection's request queue may sit empty with a piece still in
/// progress before the worker rebuilds requests for it.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies one block transfer: which piece, what byte offset within it,
/// and how long the block is.
pub type RequestKey = (u32, u32, u32);

/// An outbound block request, either queued or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Request {
    pub fn key(&self) -> RequestKey {
        (self.piece, self.offset, self.length)
    }
}

/// A block of piece data, either arriving from a peer (a PIECE message) or
/// about to be sent to one.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceBlock {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl PieceBlock {
    pub fn key(&self) -> RequestKey {
        (self.piece, self.offset, self.data.len() as u32)
    }
}

/// A block read from local storage, ready to serve to a peer that requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRead {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
    pub bytes: Bytes,
}

impl BlockRead {
    pub fn key(&self) -> RequestKey {
        (self.piece, self.offset, self.length)
    }
}
