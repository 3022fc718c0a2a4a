use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    config::Config,
    message::{self, BlockRequest, Frame, FrameDecoder, Message, PieceBlock},
    peer::PeerAddr,
    piece_registry::BlockOutcome,
    protocol::{self, ProtocolError},
    swarm::SwarmState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Terminated,
}

#[derive(Debug)]
enum Inbound {
    Frame(Frame),
    /// Injected on kill so the message worker stops waiting.
    Quit,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub verify_info_hash: bool,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
            verify_info_hash: config.verify_info_hash,
        }
    }
}

/// Piece the message worker is downloading and its single outstanding request.
#[derive(Debug, Default)]
struct PieceWork {
    assigned: Option<u32>,
    outstanding: Option<(BlockRequest, Instant)>,
}

impl PieceWork {
    fn reset(&mut self) {
        self.assigned = None;
        self.outstanding = None;
    }
}

/// One connection to a remote peer.
///
/// Two tasks share a session: the I/O loop owns the socket, decodes frames into the inbound
/// queue and drains the outgoing queue; the message worker consumes the inbound queue in order
/// and drives piece assignment and block requests.
pub struct PeerSession {
    peer: PeerAddr,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    config: SessionConfig,
    state: Mutex<SessionState>,
    alive: AtomicBool,
    choked: AtomicBool,
    remote_peer_id: Mutex<Option<[u8; 20]>>,
    outgoing_tx: flume::Sender<Message>,
    outgoing_rx: flume::Receiver<Message>,
    inbound_tx: flume::Sender<Inbound>,
    inbound_rx: flume::Receiver<Inbound>,
    kill: CancellationToken,
    swarm: Arc<SwarmState>,
}

impl PeerSession {
    pub fn new(
        peer: PeerAddr,
        swarm: Arc<SwarmState>,
        local_peer_id: [u8; 20],
        config: SessionConfig,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = flume::unbounded();
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Arc::new(Self {
            peer,
            info_hash: swarm.meta.info_hash,
            local_peer_id,
            config,
            state: Mutex::new(SessionState::Connecting),
            alive: AtomicBool::new(true),
            choked: AtomicBool::new(true),
            remote_peer_id: Mutex::new(None),
            outgoing_tx,
            outgoing_rx,
            inbound_tx,
            inbound_rx,
            kill: CancellationToken::new(),
            swarm,
        })
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_choked(&self) -> bool {
        self.choked.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        *self.remote_peer_id.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Terminated {
            *state = next;
        }
    }

    /// Closes the session. Safe to call more than once.
    pub fn kill(&self) {
        self.set_state(SessionState::Terminated);
        if self.alive.swap(false, Ordering::AcqRel) {
            self.kill.cancel();
            let _ = self.inbound_tx.send(Inbound::Quit);
        }
    }

    pub fn send(&self, message: Message) {
        if self.outgoing_tx.send(message).is_err() {
            debug!("{}: outgoing queue closed", self.peer);
        }
    }

    /// Connects and serves the peer until the session terminates.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let worker = tokio::spawn(self.clone().message_worker());

        match self.io_loop().await {
            Ok(()) => debug!("{}: session closed", self.peer),
            Err(e) => debug!("{}: session terminated: {}", self.peer, e),
        }
        self.kill();

        let _ = worker.await;
        self.swarm.release_peer(&self.peer);
        Ok(())
    }

    async fn io_loop(&self) -> Result<(), ProtocolError> {
        debug!("connecting to {}", self.peer);
        let mut stream = tokio::select! {
            _ = self.kill.cancelled() => return Ok(()),
            r = protocol::connect(self.peer, self.config.connect_timeout) => r?,
        };
        protocol::send_handshake(&mut stream, self.info_hash, self.local_peer_id).await?;
        self.set_state(SessionState::Handshaking);

        let (mut read, mut write) = stream.split();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 16 * 1024];
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.kill.cancelled() => return Ok(()),
                _ = &mut deadline => {
                    return Err(match self.state() {
                        SessionState::Active => ProtocolError::Idle(self.config.idle_timeout),
                        _ => ProtocolError::HandshakeTimeout(self.config.handshake_timeout),
                    });
                }
                r = read.read(&mut buf) => {
                    let n = r?;
                    if n == 0 {
                        return Err(ProtocolError::Closed);
                    }
                    decoder.extend(&buf[..n]);
                    while let Some(frame) = decoder.next_frame()? {
                        if let Frame::Handshake(handshake) = &frame {
                            protocol::check_handshake(
                                handshake,
                                &self.info_hash,
                                self.config.verify_info_hash,
                            )?;
                            *self.remote_peer_id.lock() = Some(handshake.peer_id);
                            self.set_state(SessionState::Active);
                            debug!("{}: handshake complete", self.peer);
                            self.send(Message::Interested);
                        }
                        if self.inbound_tx.send(Inbound::Frame(frame)).is_err() {
                            return Ok(());
                        }
                    }
                    if self.state() == SessionState::Active {
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.config.idle_timeout);
                    }
                }
                msg = self.outgoing_rx.recv_async() => {
                    let Ok(msg) = msg else {
                        return Ok(());
                    };
                    trace!("{}: sending {:?}", self.peer, MessageSummary(&msg));
                    write.write_all(&message::serialize(&msg)).await?;
                }
            }
        }
    }

    async fn message_worker(self: Arc<Self>) {
        let mut work = PieceWork::default();

        loop {
            let inbound = match tokio::time::timeout(
                self.config.request_timeout,
                self.inbound_rx.recv_async(),
            )
            .await
            {
                Ok(Ok(inbound)) => Some(inbound),
                Ok(Err(_)) => break,
                Err(_) => None,
            };

            match inbound {
                Some(Inbound::Quit) => break,
                // Frames queued before a kill must not touch shared state.
                _ if !self.is_alive() => break,
                Some(Inbound::Frame(Frame::Handshake(handshake))) => {
                    debug!(
                        "{}: got handshake from {}",
                        self.peer,
                        String::from_utf8_lossy(&handshake.peer_id)
                    );
                }
                Some(Inbound::Frame(Frame::Message(msg))) => self.on_received_message(msg, &mut work),
                None => {}
            }

            if !self.is_alive() {
                break;
            }
            if self.is_choked() || self.state() != SessionState::Active {
                continue;
            }
            if !self.drive(&mut work) {
                break;
            }
        }
        trace!("{}: message worker done", self.peer);
    }

    /// Makes sure an unchoked session has a piece and a request in flight. Returns false when
    /// the session was killed because the peer has nothing left we need.
    fn drive(&self, work: &mut PieceWork) -> bool {
        for _ in 0..2 {
            if work.assigned.is_none() {
                match self.swarm.assign_next_piece(self.peer) {
                    Some(index) => {
                        debug!("{} assigned piece {}", self.peer, index);
                        work.assigned = Some(index);
                        work.outstanding = None;
                    }
                    None => {
                        info!(
                            "no pieces left to download or {} has none we need",
                            self.peer
                        );
                        self.kill();
                        return false;
                    }
                }
            }
            if self.request_block(work) {
                return true;
            }
        }
        true
    }

    /// Requests the lowest gap of the assigned piece unless a fresh request is outstanding.
    /// Returns false when the assignment is gone.
    fn request_block(&self, work: &mut PieceWork) -> bool {
        let Some(index) = work.assigned else {
            return false;
        };
        if let Some((_, sent)) = work.outstanding {
            if sent.elapsed() < self.config.request_timeout {
                return true;
            }
        }
        match self.swarm.next_request(&self.peer, index) {
            Some(req) => {
                trace!(
                    "{}: requesting piece {} begin {} length {}",
                    self.peer,
                    req.index,
                    req.begin,
                    req.length
                );
                self.send(message::format_request(req.index, req.begin, req.length));
                work.outstanding = Some((req, Instant::now()));
                true
            }
            None => {
                work.reset();
                false
            }
        }
    }

    fn on_received_message(&self, message: Message, work: &mut PieceWork) {
        match message {
            Message::KeepAlive => {
                trace!("{}: keep alive", self.peer);
                self.send(Message::KeepAlive);
            }
            Message::Choke => {
                debug!("{} choked us", self.peer);
                self.choked.store(true, Ordering::Release);
                work.outstanding = None;
            }
            Message::Unchoke => {
                debug!("{} unchoked us", self.peer);
                self.choked.store(false, Ordering::Release);
            }
            Message::Interested => debug!("{} is interested", self.peer),
            Message::NotInterested => debug!("{} is not interested", self.peer),
            Message::Have(index) => self.swarm.on_have(self.peer, index),
            Message::Bitfield(payload) => {
                debug!("{} sent bitfield", self.peer);
                self.swarm.on_bitfield(self.peer, &payload);
            }
            Message::Request(_) | Message::Cancel(_) => {
                debug!("{} sent a request/cancel, uploading is not supported", self.peer);
            }
            Message::Piece(block) => self.on_piece(block, work),
            Message::Port(_) => trace!("{} declared a listen port", self.peer),
        }
    }

    fn on_piece(&self, block: PieceBlock, work: &mut PieceWork) {
        if work.assigned != Some(block.index) {
            debug!(
                "{}: piece index mismatch, expected {:?} got {}",
                self.peer, work.assigned, block.index
            );
            return;
        }
        if let Some((req, _)) = work.outstanding {
            if req.index == block.index && req.begin == block.begin {
                work.outstanding = None;
            }
        }

        match self.swarm.receive_block(&self.peer, &block) {
            BlockOutcome::Progress { received, size } => {
                trace!(
                    "{} {:.1}% complete with piece {}",
                    self.peer,
                    received as f64 / size as f64 * 100.0,
                    block.index
                );
            }
            BlockOutcome::Ignored => {
                trace!(
                    "{}: ignored block {} of piece {}",
                    self.peer,
                    block.begin,
                    block.index
                );
            }
            BlockOutcome::Filled(filled) => match self.swarm.verify_piece(&self.peer, filled) {
                Some(piece) => {
                    debug!("{}: piece {} verified", self.peer, piece.index);
                    self.swarm.commit_piece(piece);
                    work.reset();
                }
                None => work.outstanding = None,
            },
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .field("choked", &self.is_choked())
            .finish()
    }
}

/// Keeps block payloads out of trace output.
struct MessageSummary<'a>(&'a Message);

impl std::fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Message::Piece(block) => write!(
                f,
                "Piece {{ index: {}, begin: {}, len: {} }}",
                block.index,
                block.begin,
                block.data.len()
            ),
            Message::Bitfield(bits) => write!(f, "Bitfield({} bytes)", bits.len()),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        file::{FileEntry, TorrentMeta},
        piece::PieceStatus,
    };

    fn swarm(pieces: usize) -> Arc<SwarmState> {
        let meta = TorrentMeta {
            announce: "http://127.0.0.1:1/announce".to_string(),
            name: "session".to_string(),
            info_hash: [5u8; 20],
            piece_length: 16,
            piece_hashes: vec![[0u8; 20]; pieces],
            files: vec![FileEntry {
                path: PathBuf::from("session"),
                length: 16 * pieces as u64,
                byte_offset: 0,
                md5sum: None,
                selected: true,
            }],
            total_size: 16 * pieces as u64,
        };
        SwarmState::new(Arc::new(meta)).0
    }

    fn config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(500),
            ..SessionConfig::from(&Config::default())
        }
    }

    #[tokio::test]
    async fn frames_queued_before_kill_are_dropped() {
        let state = swarm(2);
        let peer = PeerAddr::from(([10, 0, 0, 1], 6881));
        let session = PeerSession::new(peer, state.clone(), [1u8; 20], config());

        for msg in [Message::Bitfield(vec![0b1100_0000]), Message::Have(1)] {
            session
                .inbound_tx
                .send(Inbound::Frame(Frame::Message(msg)))
                .unwrap();
        }
        session.kill();
        session.clone().message_worker().await;

        assert!(state.peer_states().bitfield(&peer).is_none());
        assert_eq!(state.registry().count(PieceStatus::NotFound), 2);
    }

    #[tokio::test]
    async fn finished_session_releases_its_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        drop(listener);

        let state = swarm(2);
        state.on_bitfield(peer, &[0b1100_0000]);
        assert!(state.assign_next_piece(peer).is_some());

        let session = PeerSession::new(peer, state.clone(), [1u8; 20], config());
        session.clone().run().await.unwrap();

        assert!(!session.is_alive());
        assert!(state.peer_states().bitfield(&peer).is_none());
        let registry = state.registry();
        assert_eq!(registry.count(PieceStatus::Assigned), 0);
        assert_eq!(registry.count(PieceStatus::NotFound), 2);
    }
}
