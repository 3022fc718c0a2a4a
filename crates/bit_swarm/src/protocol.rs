use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;

use crate::handshake::{Handshake, HandshakeError};
use crate::message::MessageError;
use crate::peer::PeerAddr;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("timed out")]
    Timeout(#[from] Elapsed),
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("message: {0}")]
    Message(#[from] MessageError),
    #[error("peer answered with a different info hash")]
    InfoHashMismatch,
    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("peer closed the connection")]
    Closed,
    #[error("no data received for {0:?}")]
    Idle(Duration),
}

pub async fn connect(peer: PeerAddr, connect_timeout: Duration) -> Result<TcpStream, ProtocolError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(peer)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Writes our handshake straight to the socket; it never goes through the outgoing queue.
pub async fn send_handshake(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<(), ProtocolError> {
    let handshake = Handshake::new(info_hash, peer_id);
    stream.write_all(&handshake.serialize()).await?;
    Ok(())
}

/// Checks a peer's handshake against the torrent we are downloading.
pub fn check_handshake(
    handshake: &Handshake,
    info_hash: &[u8; 20],
    verify_info_hash: bool,
) -> Result<(), ProtocolError> {
    if verify_info_hash && &handshake.info_hash != info_hash {
        return Err(ProtocolError::InfoHashMismatch);
    }
    Ok(())
}
