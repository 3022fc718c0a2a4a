use thiserror::Error;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum HandshakeError {
    #[error("handshake must be {HANDSHAKE_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("expected protocol length 19, got {0}")]
    InvalidProtocolLength(u8),
    #[error("unknown protocol string")]
    InvalidProtocol,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut handshake = Vec::with_capacity(HANDSHAKE_LEN);
        handshake.push(PROTOCOL.len() as u8);
        handshake.extend(PROTOCOL);
        handshake.extend(self.reserved);
        handshake.extend(self.info_hash);
        handshake.extend(self.peer_id);
        handshake
    }

    pub fn read(buf: &[u8]) -> Result<Handshake, HandshakeError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::InvalidLength(buf.len()));
        }
        if buf[0] as usize != PROTOCOL.len() {
            return Err(HandshakeError::InvalidProtocolLength(buf[0]));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(HandshakeError::InvalidProtocol);
        }
        let mut handshake = Handshake::new([0u8; 20], [0u8; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}
