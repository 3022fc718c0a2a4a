use std::{fmt::Write, time::Duration};

use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::peer::{self, PeerAddr};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("could not decode tracker response: {0}")]
    Decode(#[from] serde_bencode::Error),
    #[error("tracker failure: {0}")]
    Failure(String),
    #[error("compact peer list of {0} bytes is not a multiple of 6")]
    InvalidPeers(usize),
    #[error("tracker response has no interval")]
    MissingInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<PeerAddr>,
}

#[derive(Debug, Deserialize)]
struct BencodeResponse {
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Option<ByteBuf>,
    #[serde(default)]
    peers6: Option<Vec<Peer6Record>>,
}

#[derive(Debug, Deserialize)]
struct Peer6Record {
    ip: ByteBuf,
    port: u16,
}

pub fn url_encode_bytes(content: &[u8]) -> String {
    let mut out = String::with_capacity(content.len() * 3);
    for byte in content.iter() {
        match *byte as char {
            '0'..='9' | 'a'..='z' | 'A'..='Z' | '.' | '-' | '_' | '~' => out.push(*byte as char),
            _ => {
                let _ = write!(&mut out, "%{:02X}", byte);
            }
        };
    }
    out
}

pub fn build_tracker_url(announce: &str, req: &AnnounceRequest) -> String {
    let separator = if announce.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        announce,
        separator,
        url_encode_bytes(&req.info_hash),
        url_encode_bytes(&req.peer_id),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
    );
    if let Some(event) = req.event {
        url.push_str("&event=");
        url.push_str(event.as_str());
    }
    url
}

pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let response = de::from_bytes::<BencodeResponse>(body)?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    let interval = response.interval.ok_or(TrackerError::MissingInterval)?;

    let mut peers = match response.peers {
        Some(compact) => {
            peer::from_compact_v4(&compact).ok_or(TrackerError::InvalidPeers(compact.len()))?
        }
        None => vec![],
    };
    peers.extend(
        response
            .peers6
            .unwrap_or_default()
            .iter()
            .filter_map(|record| peer::from_ipv6_record(&record.ip, record.port)),
    );

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        peers,
    })
}

/// HTTP announce client for the torrent's `announce` url.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
    announce: String,
}

impl HttpTracker {
    pub fn new(announce: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            announce: announce.into(),
        }
    }

    pub async fn announce(&self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = build_tracker_url(&self.announce, req);
        let response = self.client.get(&url).send().await?;
        let body_bytes = response.bytes().await?;
        parse_response(&body_bytes)
    }
}
