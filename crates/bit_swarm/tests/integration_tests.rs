use std::io::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bit_swarm::bencode::{self, Value};
use bit_swarm::config::Config;
use bit_swarm::file::TorrentMeta;
use bit_swarm::handshake::{Handshake, HANDSHAKE_LEN};
use bit_swarm::message::{self, BlockRequest, Message, PieceBlock};
use bit_swarm::peer_connection::{PeerSession, SessionConfig, SessionState};
use bit_swarm::swarm::{SwarmCoordinator, SwarmState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PIECE_LENGTH: usize = 32768;
const REMOTE_PEER_ID: [u8; 20] = *b"-MK0001-mockpeer0001";

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(data);
    hasher.digest().bytes()
}

fn bytes(s: &str) -> Value {
    Value::Bytes(s.as_bytes().to_vec())
}

fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

/// Two files, two pieces: the first spans both files, the second is short.
fn build_torrent(content: &[u8]) -> Vec<u8> {
    let pieces: Vec<u8> = content.chunks(PIECE_LENGTH).flat_map(sha1).collect();
    let file = |path: Vec<&str>, length: usize| {
        dict(vec![
            ("length", Value::Integer(length as i64)),
            ("path", Value::List(path.into_iter().map(bytes).collect())),
        ])
    };
    let info = dict(vec![
        (
            "files",
            Value::List(vec![
                file(vec!["a.bin"], 10000),
                file(vec!["sub", "b.bin"], content.len() - 10000),
            ]),
        ),
        ("name", bytes("fixture")),
        ("piece length", Value::Integer(PIECE_LENGTH as i64)),
        ("pieces", Value::Bytes(pieces)),
    ]);
    bencode::encode(&dict(vec![
        ("announce", bytes("http://127.0.0.1:1/announce")),
        ("info", info),
    ]))
}

fn content() -> Vec<u8> {
    (0..40000u32).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Clone)]
struct MockPeer {
    content: Arc<Vec<u8>>,
    info_hash: [u8; 20],
    num_pieces: usize,
    /// Serve garbage for the first block of piece 0 once.
    corrupt_once: Arc<AtomicBool>,
    unchoke: bool,
}

impl MockPeer {
    async fn serve(self, listener: TcpListener) {
        while let Ok((socket, _)) = listener.accept().await {
            let peer = self.clone();
            tokio::spawn(async move {
                let _ = peer.handler(socket).await;
            });
        }
    }

    async fn handler(&self, mut socket: TcpStream) -> Result<(), Error> {
        let mut handshake = vec![0u8; HANDSHAKE_LEN];
        socket.read_exact(&mut handshake).await?;
        socket
            .write_all(&Handshake::new(self.info_hash, REMOTE_PEER_ID).serialize())
            .await?;

        let mut bitfield = vec![0u8; self.num_pieces.div_ceil(8)];
        for i in 0..self.num_pieces {
            bitfield[i / 8] |= 1 << (7 - i % 8);
        }
        socket
            .write_all(&message::serialize(&Message::Bitfield(bitfield)))
            .await?;
        if self.unchoke {
            socket
                .write_all(&message::serialize(&Message::Unchoke))
                .await?;
        }

        loop {
            let len = socket.read_u32().await? as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await?;
            let Ok(Some(Message::Request(req))) = message::read(&body) else {
                continue;
            };

            let start = req.index as usize * PIECE_LENGTH + req.begin as usize;
            let mut data = self.content[start..start + req.length as usize].to_vec();
            if req.index == 0 && req.begin == 0 && self.corrupt_once.swap(false, Ordering::SeqCst)
            {
                data.iter_mut().for_each(|b| *b = !*b);
            }
            let block = Message::Piece(PieceBlock {
                index: req.index,
                begin: req.begin,
                data,
            });
            socket.write_all(&message::serialize(&block)).await?;
        }
    }
}

async fn spawn_mock(
    meta: &TorrentMeta,
    content: &[u8],
    corrupt_once: bool,
    unchoke: bool,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mock = MockPeer {
        content: Arc::new(content.to_vec()),
        info_hash: meta.info_hash,
        num_pieces: meta.num_pieces(),
        corrupt_once: Arc::new(AtomicBool::new(corrupt_once)),
        unchoke,
    };
    tokio::spawn(mock.serve(listener));
    addr
}

fn test_config(dir: &Path) -> Config {
    Config {
        download_dir: dir.to_path_buf(),
        maintenance_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

fn read_back(dir: &Path) -> Vec<u8> {
    let mut data = std::fs::read(dir.join("fixture/a.bin")).unwrap();
    data.extend(std::fs::read(dir.join("fixture/sub/b.bin")).unwrap());
    data
}

async fn download(corrupt_once: bool) {
    let content = content();
    let meta = TorrentMeta::from_bytes(&build_torrent(&content)).unwrap();
    assert_eq!(meta.num_pieces(), 2);
    let peer = spawn_mock(&meta, &content, corrupt_once, true).await;

    let dir = tempfile::tempdir().unwrap();
    let coordinator = SwarmCoordinator::new(meta, test_config(dir.path()));
    coordinator.add_available_peers([peer]);
    let progress = coordinator.progress();

    tokio::time::timeout(Duration::from_secs(20), coordinator.clone().run())
        .await
        .expect("download timed out")
        .unwrap();

    assert!(coordinator.state().is_complete());
    assert_eq!(read_back(dir.path()), content);
    let last = progress.drain().last().unwrap();
    assert_eq!(last.completed, 2);
    assert_eq!(last.bytes_written, 40000);
}

#[tokio::test]
async fn downloads_multi_file_torrent_from_one_peer() {
    download(false).await;
}

#[tokio::test]
async fn recovers_from_corrupted_piece() {
    download(true).await;
}

async fn wait_for_state(session: &PeerSession, state: SessionState) -> bool {
    for _ in 0..100 {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn session_against_foreign_peer(verify_info_hash: bool) -> Arc<PeerSession> {
    let content = content();
    let meta = TorrentMeta::from_bytes(&build_torrent(&content)).unwrap();
    let mut foreign = meta.clone();
    foreign.info_hash = [0xAB; 20];
    let peer = spawn_mock(&foreign, &content, false, false).await;

    let (state, _pieces) = SwarmState::new(Arc::new(meta));
    let config = SessionConfig {
        verify_info_hash,
        ..SessionConfig::from(&Config::default())
    };
    let session = PeerSession::new(peer, state, [1u8; 20], config);
    tokio::spawn(session.clone().run());
    session
}

#[tokio::test]
async fn info_hash_mismatch_terminates_session() {
    let session = session_against_foreign_peer(true).await;
    assert!(wait_for_state(&session, SessionState::Terminated).await);
    assert!(!session.is_alive());
    assert_eq!(session.remote_peer_id(), None);
}

#[tokio::test]
async fn info_hash_check_can_be_disabled() {
    let session = session_against_foreign_peer(false).await;
    assert!(wait_for_state(&session, SessionState::Active).await);
    assert_eq!(session.remote_peer_id(), Some(REMOTE_PEER_ID));
    session.kill();
    assert_eq!(session.state(), SessionState::Terminated);
}

/// Accepts one session against a local listener and completes the handshake; the test then
/// plays the remote side by hand.
async fn scripted_session(config: SessionConfig) -> (Arc<PeerSession>, TcpStream) {
    let content = content();
    let meta = TorrentMeta::from_bytes(&build_torrent(&content)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = listener.local_addr().unwrap();

    let (state, _pieces) = SwarmState::new(Arc::new(meta.clone()));
    let session = PeerSession::new(peer, state, [1u8; 20], config);
    tokio::spawn(session.clone().run());

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut handshake = vec![0u8; HANDSHAKE_LEN];
    socket.read_exact(&mut handshake).await.unwrap();
    socket
        .write_all(&Handshake::new(meta.info_hash, REMOTE_PEER_ID).serialize())
        .await
        .unwrap();
    (session, socket)
}

async fn send_message(socket: &mut TcpStream, msg: Message) {
    socket.write_all(&message::serialize(&msg)).await.unwrap();
}

/// Reads frames until one matches, failing after two seconds.
async fn expect_message(socket: &mut TcpStream, wanted: impl Fn(&Message) -> bool) -> Message {
    let read = async {
        loop {
            let len = socket.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            if let Some(msg) = message::read(&body).unwrap() {
                if wanted(&msg) {
                    return msg;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("expected message never arrived")
}

fn session_config() -> SessionConfig {
    SessionConfig::from(&Config::default())
}

#[tokio::test]
async fn silent_peer_hits_idle_timeout() {
    let started = Instant::now();
    let config = SessionConfig {
        idle_timeout: Duration::from_millis(300),
        ..session_config()
    };
    let (session, _socket) = scripted_session(config).await;

    assert!(wait_for_state(&session, SessionState::Terminated).await);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!session.is_alive());
}

#[tokio::test]
async fn answers_keep_alive_with_keep_alive() {
    let (session, mut socket) = scripted_session(session_config()).await;
    expect_message(&mut socket, |m| matches!(m, Message::Interested)).await;

    send_message(&mut socket, Message::KeepAlive).await;
    expect_message(&mut socket, |m| matches!(m, Message::KeepAlive)).await;
    assert_eq!(session.state(), SessionState::Active);
    session.kill();
}

#[tokio::test]
async fn choke_drops_outstanding_request() {
    let config = SessionConfig {
        request_timeout: Duration::from_secs(10),
        ..session_config()
    };
    let (session, mut socket) = scripted_session(config).await;
    send_message(&mut socket, Message::Bitfield(vec![0b1100_0000])).await;
    send_message(&mut socket, Message::Unchoke).await;
    let first = expect_message(&mut socket, |m| matches!(m, Message::Request(_))).await;
    assert_eq!(
        first,
        Message::Request(BlockRequest {
            index: 0,
            begin: 0,
            length: 16384,
        })
    );

    // Without the choke resetting it, the next request would wait for the 10s timeout.
    send_message(&mut socket, Message::Choke).await;
    send_message(&mut socket, Message::Unchoke).await;
    let again = expect_message(&mut socket, |m| matches!(m, Message::Request(_))).await;
    assert_eq!(again, first);
    session.kill();
}

#[tokio::test]
async fn session_ends_when_peer_has_nothing_needed() {
    let (session, mut socket) = scripted_session(session_config()).await;
    send_message(&mut socket, Message::Bitfield(vec![0])).await;
    send_message(&mut socket, Message::Unchoke).await;

    assert!(wait_for_state(&session, SessionState::Terminated).await);
    assert!(!session.is_alive());
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(2), socket.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "session kept the connection open");
}
