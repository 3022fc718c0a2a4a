use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::{
    bitfield::Bitfield,
    config::Config,
    disk::{DiskWriter, Progress},
    file::TorrentMeta,
    message::{BlockRequest, PieceBlock},
    peer::PeerAddr,
    peer_connection::{PeerSession, SessionConfig},
    peer_state::PeerStates,
    piece_registry::{BlockOutcome, FilledPiece, PieceRegistry, VerifiedPiece},
    tracker::{AnnounceEvent, AnnounceRequest, HttpTracker},
    utils,
};

/// State every peer session of one torrent works against.
#[derive(Debug)]
pub struct SwarmState {
    pub meta: Arc<TorrentMeta>,
    registry: Mutex<PieceRegistry>,
    peer_states: PeerStates,
    piece_tx: flume::Sender<VerifiedPiece>,
    downloaded: AtomicU64,
}

impl SwarmState {
    pub fn new(meta: Arc<TorrentMeta>) -> (Arc<Self>, flume::Receiver<VerifiedPiece>) {
        let (piece_tx, piece_rx) = flume::unbounded();
        let state = Arc::new(Self {
            registry: Mutex::new(PieceRegistry::new(&meta)),
            peer_states: PeerStates::default(),
            piece_tx,
            downloaded: AtomicU64::new(0),
            meta,
        });
        (state, piece_rx)
    }

    pub fn num_pieces(&self) -> usize {
        self.meta.num_pieces()
    }

    pub fn registry(&self) -> MutexGuard<'_, PieceRegistry> {
        self.registry.lock()
    }

    pub fn peer_states(&self) -> &PeerStates {
        &self.peer_states
    }

    /// Bytes of verified pieces handed to the disk writer.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.meta.total_size.saturating_sub(self.downloaded())
    }

    pub fn on_bitfield(&self, peer: PeerAddr, payload: &[u8]) {
        let bitfield = Bitfield::from_bytes(payload, self.num_pieces());
        let pieces: Vec<usize> = bitfield.pieces().collect();
        self.peer_states.set_bitfield(peer, bitfield);

        let mut registry = self.registry.lock();
        for index in pieces {
            registry.add_owner(index, peer);
        }
    }

    pub fn on_have(&self, peer: PeerAddr, index: u32) {
        if index as usize >= self.num_pieces() {
            debug!("{} sent have for unknown piece {}", peer, index);
            return;
        }
        self.peer_states.add_if_not_seen(peer, self.num_pieces());
        if self.peer_states.set_piece(peer, index as usize) {
            self.registry.lock().add_owner(index as usize, peer);
        }
    }

    /// Rarest-first assignment over the pieces `peer` advertised.
    pub fn assign_next_piece(&self, peer: PeerAddr) -> Option<u32> {
        let bitfield = self.peer_states.bitfield(&peer)?;
        self.registry.lock().assign_next_piece(peer, &bitfield)
    }

    pub fn next_request(&self, peer: &PeerAddr, index: u32) -> Option<BlockRequest> {
        self.registry.lock().next_request(peer, index)
    }

    pub fn receive_block(&self, peer: &PeerAddr, block: &PieceBlock) -> BlockOutcome {
        self.registry.lock().receive_block(peer, block)
    }

    /// Hashes a filled piece without holding the registry lock, then records the result.
    pub fn verify_piece(&self, peer: &PeerAddr, filled: FilledPiece) -> Option<VerifiedPiece> {
        let matched = filled.verify();
        self.registry.lock().finish_piece(peer, filled, matched)
    }

    /// Hands a verified piece to the disk writer.
    pub fn commit_piece(&self, piece: VerifiedPiece) {
        let index = piece.index;
        self.downloaded
            .fetch_add(piece.buf.len() as u64, Ordering::Relaxed);
        if self.piece_tx.send(piece).is_err() {
            warn!("disk writer is gone, dropping piece {}", index);
        }
    }

    /// Forgets a disconnected peer's bitfield, ownership and assignments.
    pub fn release_peer(&self, peer: &PeerAddr) {
        self.peer_states.remove(peer);
        self.registry.lock().release_peer(peer);
    }

    pub fn aggregate_bitfields(&self) {
        let snapshot = self.peer_states.snapshot();
        self.registry.lock().aggregate_bitfields(&snapshot);
    }

    pub fn unassigned_pieces(&self) -> usize {
        self.registry.lock().unassigned()
    }

    pub fn is_complete(&self) -> bool {
        self.registry.lock().is_complete()
    }
}

#[derive(Debug, Default)]
struct PeerSet {
    /// Every address the tracker handed out, one per IP.
    available: Vec<PeerAddr>,
    connected: Vec<Arc<PeerSession>>,
    dead: HashSet<IpAddr>,
}

/// Drives one torrent: tracker announces, peer admission and pruning, and the disk writer.
pub struct SwarmCoordinator {
    state: Arc<SwarmState>,
    config: Config,
    peer_id: [u8; 20],
    peers: Mutex<PeerSet>,
    stop: CancellationToken,
    piece_rx: flume::Receiver<VerifiedPiece>,
    progress_tx: flume::Sender<Progress>,
    progress_rx: flume::Receiver<Progress>,
}

impl SwarmCoordinator {
    pub fn new(meta: TorrentMeta, config: Config) -> Arc<Self> {
        Self::with_peer_id(meta, config, utils::generate_peer_id())
    }

    pub fn with_peer_id(meta: TorrentMeta, config: Config, peer_id: [u8; 20]) -> Arc<Self> {
        let (state, piece_rx) = SwarmState::new(Arc::new(meta));
        let (progress_tx, progress_rx) = flume::unbounded();
        Arc::new(Self {
            state,
            config,
            peer_id,
            peers: Mutex::new(PeerSet::default()),
            stop: CancellationToken::new(),
            piece_rx,
            progress_tx,
            progress_rx,
        })
    }

    pub fn state(&self) -> &Arc<SwarmState> {
        &self.state
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Progress events from the disk writer.
    pub fn progress(&self) -> flume::Receiver<Progress> {
        self.progress_rx.clone()
    }

    /// Stops the download early. `run` returns once its tasks wind down.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Queues tracker peers for admission, skipping IPs we already know. Returns how many
    /// were new.
    pub fn add_available_peers(&self, peers: impl IntoIterator<Item = PeerAddr>) -> usize {
        let mut set = self.peers.lock();
        let mut added = 0;
        for peer in peers {
            if set.available.iter().any(|known| known.ip() == peer.ip()) {
                continue;
            }
            set.available.push(peer);
            added += 1;
        }
        added
    }

    pub fn available_peers(&self) -> Vec<PeerAddr> {
        self.peers.lock().available.clone()
    }

    pub fn connected_peers(&self) -> Vec<PeerAddr> {
        self.peers
            .lock()
            .connected
            .iter()
            .map(|session| session.peer())
            .collect()
    }

    pub fn is_dead(&self, ip: &IpAddr) -> bool {
        self.peers.lock().dead.contains(ip)
    }

    /// One maintenance tick: prune dead sessions, refresh piece ownership, admit new peers.
    pub fn maintain_peers(&self) {
        self.prune_dead_sessions();
        self.state.aggregate_bitfields();
        self.admit_sessions();
    }

    fn prune_dead_sessions(&self) {
        let mut set = self.peers.lock();
        let (alive, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut set.connected)
            .into_iter()
            .partition(|session| session.is_alive());
        set.connected = alive;

        for session in dead {
            let peer = session.peer();
            info!("removing dead peer {}", peer);
            set.dead.insert(peer.ip());
            self.state.release_peer(&peer);
        }
    }

    fn admit_sessions(&self) {
        let mut budget = self.state.unassigned_pieces();
        if budget == 0 {
            return;
        }

        let mut set = self.peers.lock();
        let mut busy: HashSet<IpAddr> = set.connected.iter().map(|s| s.peer().ip()).collect();
        let candidates: Vec<PeerAddr> = set
            .available
            .iter()
            .filter(|peer| !set.dead.contains(&peer.ip()))
            .copied()
            .collect();

        for peer in candidates {
            if set.connected.len() >= self.config.peer_limit || budget == 0 {
                break;
            }
            if !busy.insert(peer.ip()) {
                continue;
            }
            budget -= 1;

            debug!("admitting peer {}", peer);
            let session = PeerSession::new(
                peer,
                self.state.clone(),
                self.peer_id,
                SessionConfig::from(&self.config),
            );
            utils::spawn(info_span!("peer", %peer), session.clone().run());
            set.connected.push(session);
        }
    }

    fn kill_all_sessions(&self) {
        for session in self.peers.lock().connected.drain(..) {
            session.kill();
        }
    }

    /// Downloads the whole torrent into `config.download_dir`.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let meta = self.state.meta.clone();
        info!(
            "downloading {} ({} bytes, {} pieces, info hash {})",
            meta.name,
            meta.total_size,
            meta.num_pieces(),
            meta.info_hash_hex()
        );

        let writer = DiskWriter::new(&self.config.download_dir, &meta);
        writer
            .allocate()
            .await
            .context("allocating destination files")?;

        let announce = utils::spawn(info_span!("announce"), self.clone().announce_loop());
        let maintenance = utils::spawn(info_span!("maintenance"), self.clone().maintenance_loop());

        let result = writer
            .run(
                self.piece_rx.clone(),
                self.progress_tx.clone(),
                self.stop.clone(),
            )
            .await;

        self.stop.cancel();
        self.kill_all_sessions();
        let _ = tokio::join!(announce, maintenance);

        if result.is_ok() && self.state.is_complete() {
            info!("download of {} complete", meta.name);
        }
        result
    }

    async fn announce_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let tracker = HttpTracker::new(self.state.meta.announce.clone());
        let mut event = Some(AnnounceEvent::Started);
        let mut interval = self.config.announce_interval;

        loop {
            let req = AnnounceRequest {
                info_hash: self.state.meta.info_hash,
                peer_id: self.peer_id,
                port: self.config.listen_port,
                uploaded: 0,
                downloaded: self.state.downloaded(),
                left: self.state.left(),
                event,
            };

            let response = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                r = tracker.announce(&req) => r,
            };
            match response {
                Ok(response) => {
                    event = None;
                    if response.interval > Duration::ZERO {
                        interval = response.interval;
                    }
                    let added = self.add_available_peers(response.peers);
                    info!(
                        "tracker returned {} new peers, next announce in {:?}",
                        added, interval
                    );
                }
                Err(e) => warn!("announce failed: {:#}", e),
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => self.maintain_peers(),
            }
        }
    }
}

impl std::fmt::Debug for SwarmCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmCoordinator")
            .field("name", &self.state.meta.name)
            .field("connected", &self.peers.lock().connected.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{file::FileEntry, piece::PieceStatus};

    fn meta(pieces: usize) -> TorrentMeta {
        TorrentMeta {
            announce: "http://127.0.0.1:1/announce".to_string(),
            name: "swarm".to_string(),
            info_hash: [3u8; 20],
            piece_length: 16,
            piece_hashes: vec![[0u8; 20]; pieces],
            files: vec![FileEntry {
                path: PathBuf::from("swarm"),
                length: 16 * pieces as u64,
                byte_offset: 0,
                md5sum: None,
                selected: true,
            }],
            total_size: 16 * pieces as u64,
        }
    }

    fn addr(n: u8, port: u16) -> PeerAddr {
        PeerAddr::from(([127, 0, 0, n], port))
    }

    #[test]
    fn dedupes_peers_by_ip() {
        let coordinator = SwarmCoordinator::new(meta(2), Config::default());
        assert_eq!(
            coordinator.add_available_peers([addr(1, 1000), addr(1, 2000), addr(2, 1000)]),
            2
        );
        assert_eq!(coordinator.add_available_peers([addr(2, 3000)]), 0);
        assert_eq!(
            coordinator.available_peers(),
            vec![addr(1, 1000), addr(2, 1000)]
        );
    }

    #[test]
    fn have_and_bitfield_update_ownership() {
        let (state, _rx) = SwarmState::new(Arc::new(meta(3)));
        state.on_bitfield(addr(1, 1), &[0b1010_0000]);
        state.on_have(addr(2, 1), 1);
        state.on_have(addr(2, 1), 7);

        let registry = state.registry();
        assert_eq!(registry.piece(0).unwrap().owners().len(), 1);
        assert_eq!(registry.piece(1).unwrap().owners().len(), 1);
        assert_eq!(registry.piece(2).unwrap().owners().len(), 1);
        assert_eq!(registry.count(PieceStatus::Waiting), 3);
    }

    #[test]
    fn assignment_requires_a_known_bitfield() {
        let (state, _rx) = SwarmState::new(Arc::new(meta(2)));
        assert_eq!(state.assign_next_piece(addr(1, 1)), None);
        state.on_bitfield(addr(1, 1), &[0b0100_0000]);
        assert_eq!(state.assign_next_piece(addr(1, 1)), Some(1));
        assert_eq!(state.unassigned_pieces(), 1);

        state.release_peer(&addr(1, 1));
        assert_eq!(state.unassigned_pieces(), 2);
        assert!(state.peer_states().bitfield(&addr(1, 1)).is_none());
    }

    #[test]
    fn committed_pieces_reach_the_writer() {
        let (state, rx) = SwarmState::new(Arc::new(meta(2)));
        state.commit_piece(VerifiedPiece {
            index: 1,
            buf: vec![0u8; 16],
        });
        assert_eq!(state.downloaded(), 16);
        assert_eq!(state.left(), 16);
        assert_eq!(rx.try_recv().unwrap().index, 1);
    }

    #[tokio::test]
    async fn unreachable_peers_are_pruned_and_never_retried() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        drop(listener);

        let config = Config {
            connect_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        let coordinator = SwarmCoordinator::new(meta(2), config);
        coordinator.add_available_peers([peer]);
        coordinator.maintain_peers();
        assert_eq!(coordinator.connected_peers(), vec![peer]);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            coordinator.maintain_peers();
            if coordinator.is_dead(&peer.ip()) {
                break;
            }
        }
        assert!(coordinator.is_dead(&peer.ip()));
        assert!(coordinator.connected_peers().is_empty());

        coordinator.maintain_peers();
        assert!(coordinator.connected_peers().is_empty());
    }
}
