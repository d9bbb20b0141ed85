use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use crate::{
    block::{PieceBlock, Request, RequestKey, MAX_PENDING_REQUESTS, STALL_TIMEOUT},
    collab::{BlockConsumer, BlockSupplier, BlockWrite, Connection, PieceManager, RequestConsumer},
    conn_state::ConnState,
    message::Message,
};

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("received block with no matching pending request: {0:?}")]
    UnexpectedBlock(RequestKey),

    #[error("unexpected message id: {0}")]
    UnexpectedMessage(u8),

    #[error("failed to send message: {0}")]
    SendFailure(String),
}

/// Per-connection BitTorrent peer-wire protocol state machine. Driven by an
/// external scheduler calling [`ConnectionWorker::do_work`] repeatedly; the
/// worker performs no I/O scheduling of its own.
///
/// Generic over the transport (`C`) and the shared piece-selection
/// collaborator (`P`) so ownership stays acyclic: the worker holds the
/// connection directly and only a non-owning `SocketAddr` handle into the
/// piece manager, never a back-reference to whatever owns it.
pub struct ConnectionWorker<C: Connection, P: PieceManager> {
    conn: C,
    piece_manager: Arc<P>,
    conn_handle: SocketAddr,
    request_consumer: Box<dyn RequestConsumer>,
    block_consumer: Box<dyn BlockConsumer>,
    block_supplier: Box<dyn BlockSupplier>,

    state: ConnState,
    current_piece: Option<u32>,
    request_queue: VecDeque<Request>,
    pending_requests: HashSet<RequestKey>,
    pending_writes: HashMap<RequestKey, Box<dyn BlockWrite>>,
    cancelled_peer_requests: HashSet<RequestKey>,
    last_requests_built_at: Instant,

    received: u64,
    sent: u64,
}

impl<C: Connection, P: PieceManager> ConnectionWorker<C, P> {
    /// Construct a worker for an already-handshaken connection. If we have
    /// any local data, immediately posts our BITFIELD — this check goes
    /// through the same shared, lock-protected piece manager as everything
    /// else, so it is part of construction rather than a step callers must
    /// remember to call afterwards.
    pub async fn new(
        conn: C,
        piece_manager: Arc<P>,
        request_consumer: Box<dyn RequestConsumer>,
        block_consumer: Box<dyn BlockConsumer>,
        block_supplier: Box<dyn BlockSupplier>,
    ) -> Result<Self, WorkerError> {
        let conn_handle = conn.remote_peer().address;
        let mut worker = Self {
            conn,
            piece_manager,
            conn_handle,
            request_consumer,
            block_consumer,
            block_supplier,
            state: ConnState::default(),
            current_piece: None,
            request_queue: VecDeque::new(),
            pending_requests: HashSet::new(),
            pending_writes: HashMap::new(),
            cancelled_peer_requests: HashSet::new(),
            last_requests_built_at: Instant::now(),
            received: 0,
            sent: 0,
        };

        if worker.piece_manager.have_any_data().await {
            let bitfield = worker.piece_manager.get_bitfield().await;
            worker.post(Message::Bitfield(bitfield))?;
        }

        Ok(worker)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    fn post(&mut self, msg: Message) -> Result<(), WorkerError> {
        self.conn
            .post_message(msg)
            .map_err(|e| WorkerError::SendFailure(e.0))
    }

    /// Advance one tick of the protocol: handle at most one inbound message,
    /// then drive the outbound pipeline.
    #[tracing::instrument(skip(self), fields(peer = %self.conn_handle))]
    pub async fn do_work(&mut self) -> Result<(), WorkerError> {
        if self.conn.is_closed() {
            return Err(WorkerError::ConnectionClosed);
        }

        if let Some(msg) = self.conn.read_message_now() {
            self.dispatch_inbound(msg).await?;
        }

        self.serve_outbound_blocks()?;
        self.advance_piece_lifecycle().await?;

        Ok(())
    }

    async fn dispatch_inbound(&mut self, msg: Message) -> Result<(), WorkerError> {
        match msg {
            Message::KeepAlive => {}

            Message::Bitfield(bitfield) => {
                self.piece_manager
                    .peer_has_bitfield(self.conn_handle, &bitfield)
                    .await;
            }

            Message::Choke => self.state.peer_choking = true,
            Message::Unchoke => self.state.peer_choking = false,
            Message::Interested => self.state.peer_interested = true,

            Message::NotInterested => {
                self.state.peer_interested = false;
                self.post(Message::Choke)?;
                self.state.choking = true;
            }

            Message::Have { idx } => {
                self.piece_manager.peer_has_piece(self.conn_handle, idx).await;
            }

            Message::Request(request) => {
                // A choking peer sending REQUEST is etiquette-breaking, not a
                // framing error — ignore it rather than tearing the worker down.
                if !self.state.choking {
                    self.request_consumer.consume(request);
                }
            }

            Message::Cancel(request) => {
                self.cancelled_peer_requests.insert(request.key());
            }

            Message::Piece(block) => {
                let key = block.key();
                if !self.pending_requests.remove(&key) {
                    return Err(WorkerError::UnexpectedBlock(key));
                }
                self.received += block.data.len() as u64;
                let write = self.block_consumer.consume(block);
                self.pending_writes.insert(key, write);
            }

            Message::Port(_) => {}

            Message::Unknown(id) => return Err(WorkerError::UnexpectedMessage(id)),
        }

        Ok(())
    }

    fn serve_outbound_blocks(&mut self) -> Result<(), WorkerError> {
        while let Some(read) = self.block_supplier.poll() {
            let key = read.key();
            if self.cancelled_peer_requests.remove(&key) {
                continue;
            }
            self.sent += read.bytes.len() as u64;
            self.post(Message::Piece(PieceBlock {
                piece: read.piece,
                offset: read.offset,
                data: read.bytes,
            }))?;
        }
        Ok(())
    }

    async fn advance_piece_lifecycle(&mut self) -> Result<(), WorkerError> {
        if self.request_queue.is_empty() {
            if let Some(idx) = self.current_piece {
                if self.piece_manager.check_piece_completed(idx).await {
                    tracing::info!(piece = idx, "piece complete");
                    self.current_piece = None;
                    self.pending_writes.clear();
                }
            } else {
                let might_select = self
                    .piece_manager
                    .might_select_piece_for_peer(self.conn_handle)
                    .await;
                if might_select && !self.state.interested {
                    self.post(Message::Interested)?;
                    self.state.interested = true;
                } else if !might_select && self.state.interested {
                    self.post(Message::NotInterested)?;
                    self.state.interested = false;
                }
            }
        }

        if !self.state.peer_choking {
            if self.current_piece.is_none() {
                let selected = self
                    .piece_manager
                    .select_piece_for_peer(self.conn_handle)
                    .await;
                if let Some(idx) = selected {
                    let requests = self.piece_manager.build_requests_for_piece(idx).await;
                    self.current_piece = Some(idx);
                    self.request_queue.extend(requests);
                    self.last_requests_built_at = Instant::now();
                }
            } else if self.request_queue.is_empty()
                && self.last_requests_built_at.elapsed() >= STALL_TIMEOUT
            {
                let idx = self.current_piece.expect("checked above");
                self.rebuild_requests(idx).await;
            }

            self.issue_requests()?;
        }

        Ok(())
    }

    /// Re-derive the candidate request set for `idx` and filter out anything
    /// already in flight or already mid-write.
    async fn rebuild_requests(&mut self, idx: u32) {
        tracing::warn!(piece = idx, "request queue stalled, rebuilding");
        let candidates = self.piece_manager.build_requests_for_piece(idx).await;

        for request in candidates {
            let key = request.key();
            if self.pending_requests.contains(&key) {
                continue;
            }
            if let Some(write) = self.pending_writes.get(&key) {
                if write.is_complete() && !write.is_success() {
                    self.pending_writes.remove(&key);
                } else {
                    // Still in progress, or already succeeded: don't re-request.
                    continue;
                }
            }
            self.request_queue.push_back(request);
        }

        self.last_requests_built_at = Instant::now();
    }

    /// Drain the request queue while under the in-flight cap. Uses `<=`
    /// rather than `<` against `MAX_PENDING_REQUESTS`, which allows one extra
    /// request past the nominal cap at the boundary — kept as-is rather than
    /// silently tightened.
    fn issue_requests(&mut self) -> Result<(), WorkerError> {
        while !self.request_queue.is_empty() && self.pending_requests.len() <= MAX_PENDING_REQUESTS
        {
            let request = self.request_queue.pop_front().expect("checked non-empty");
            let key = request.key();
            if self.pending_requests.insert(key) {
                self.post(Message::Request(request))?;
            }
        }
        Ok(())
    }
}
