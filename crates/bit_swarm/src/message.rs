use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use crate::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        Ok(match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockRequest),
    Piece(PieceBlock),
    Cancel(BlockRequest),
    /// Listen port declaration; kept opaque.
    Port(Vec<u8>),
}

/// Everything that can arrive on a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(Handshake),
    Message(Message),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("{id:?} payload of {len} bytes is malformed")]
    InvalidPayload { id: MessageId, len: usize },
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn format_request(index: u32, begin: u32, length: u32) -> Message {
    Message::Request(BlockRequest {
        index,
        begin,
        length,
    })
}

pub fn serialize(msg: &Message) -> Vec<u8> {
    let (id, payload) = match msg {
        Message::KeepAlive => return vec![0, 0, 0, 0],
        Message::Choke => (MessageId::Choke, vec![]),
        Message::Unchoke => (MessageId::Unchoke, vec![]),
        Message::Interested => (MessageId::Interested, vec![]),
        Message::NotInterested => (MessageId::NotInterested, vec![]),
        Message::Have(index) => (MessageId::Have, index.to_be_bytes().to_vec()),
        Message::Bitfield(payload) => (MessageId::Bitfield, payload.clone()),
        Message::Request(req) => (MessageId::Request, block_request_payload(req)),
        Message::Piece(block) => {
            let mut payload = Vec::with_capacity(8 + block.data.len());
            payload.extend_from_slice(&block.index.to_be_bytes());
            payload.extend_from_slice(&block.begin.to_be_bytes());
            payload.extend_from_slice(&block.data);
            (MessageId::Piece, payload)
        }
        Message::Cancel(req) => (MessageId::Cancel, block_request_payload(req)),
        Message::Port(payload) => (MessageId::Port, payload.clone()),
    };

    let length = payload.len() as u32 + 1;
    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(id as u8);
    buf.extend_from_slice(&payload);
    buf
}

fn block_request_payload(req: &BlockRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&req.index.to_be_bytes());
    payload.extend_from_slice(&req.begin.to_be_bytes());
    payload.extend_from_slice(&req.length.to_be_bytes());
    payload
}

/// Parses one message body (type tag + payload). `Ok(None)` for unknown tags.
pub fn read(body: &[u8]) -> Result<Option<Message>, MessageError> {
    let Some((&tag, payload)) = body.split_first() else {
        return Ok(Some(Message::KeepAlive));
    };
    let id = match MessageId::try_from(tag) {
        Ok(id) => id,
        Err(unknown) => {
            debug!(
                "unexpected message id {} with {} byte payload, ignoring",
                unknown,
                payload.len()
            );
            return Ok(None);
        }
    };
    let malformed = || MessageError::InvalidPayload {
        id,
        len: payload.len(),
    };

    let message = match id {
        MessageId::Choke => Message::Choke,
        MessageId::Unchoke => Message::Unchoke,
        MessageId::Interested => Message::Interested,
        MessageId::NotInterested => Message::NotInterested,
        MessageId::Have => {
            if payload.len() != 4 {
                return Err(malformed());
            }
            Message::Have(BigEndian::read_u32(payload))
        }
        MessageId::Bitfield => Message::Bitfield(payload.to_vec()),
        MessageId::Request | MessageId::Cancel => {
            if payload.len() != 12 {
                return Err(malformed());
            }
            let req = BlockRequest {
                index: BigEndian::read_u32(&payload[0..4]),
                begin: BigEndian::read_u32(&payload[4..8]),
                length: BigEndian::read_u32(&payload[8..12]),
            };
            if id == MessageId::Request {
                Message::Request(req)
            } else {
                Message::Cancel(req)
            }
        }
        MessageId::Piece => {
            if payload.len() < 8 {
                return Err(malformed());
            }
            Message::Piece(PieceBlock {
                index: BigEndian::read_u32(&payload[0..4]),
                begin: BigEndian::read_u32(&payload[4..8]),
                data: payload[8..].to_vec(),
            })
        }
        MessageId::Port => Message::Port(payload.to_vec()),
    };
    Ok(Some(message))
}

/// Incremental decoder over the inbound byte stream.
///
/// Bytes are appended as they arrive; complete frames are drained from the front and partial
/// frames stay buffered until the rest shows up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    handshake_done: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, MessageError> {
        if !self.handshake_done {
            if let Some(&first) = self.buf.first() {
                if first != 19 {
                    return Err(HandshakeError::InvalidProtocolLength(first).into());
                }
            }
            if self.buf.len() < HANDSHAKE_LEN {
                return Ok(None);
            }
            let handshake = Handshake::read(&self.buf[..HANDSHAKE_LEN])?;
            self.buf.drain(..HANDSHAKE_LEN);
            self.handshake_done = true;
            return Ok(Some(Frame::Handshake(handshake)));
        }

        loop {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let length = BigEndian::read_u32(&self.buf[..4]) as usize;
            if length > MAX_FRAME_LEN {
                return Err(MessageError::FrameTooLarge(length));
            }
            if self.buf.len() - 4 < length {
                return Ok(None);
            }
            let frame: Vec<u8> = self.buf.drain(..4 + length).skip(4).collect();
            if let Some(message) = read(&frame)? {
                return Ok(Some(Frame::Message(message)));
            }
        }
    }
}
