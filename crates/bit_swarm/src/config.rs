use std::{path::PathBuf, time::Duration};

/// Knobs for one torrent run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the torrent's files are laid out under.
    pub download_dir: PathBuf,
    /// Port announced to the tracker.
    pub listen_port: u16,
    /// Maximum number of concurrently connected peers.
    pub peer_limit: usize,
    /// A session with no inbound data for this long is terminated.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// An unanswered block request is re-sent after this long.
    pub request_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Re-announce delay used until the tracker has told us its interval.
    pub announce_interval: Duration,
    /// Terminate sessions whose handshake carries a different info-hash.
    pub verify_info_hash: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            peer_limit: 15,
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(6),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(30),
            verify_info_hash: true,
        }
    }
}
