use std::path::PathBuf;

use clap::Parser;

/// Downloads a torrent into a directory.
#[derive(Debug, Parser)]
#[command(name = "bit-swarm", version)]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Directory the torrent's files are written under
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Maximum number of connected peers
    #[arg(long, default_value_t = 15)]
    pub peers: usize,

    /// Port announced to the tracker
    #[arg(long, default_value_t = 6881)]
    pub port: u16,

    /// Seconds without data before a peer is dropped
    #[arg(long, default_value_t = 120)]
    pub idle_timeout: u64,

    /// Accept peers whose handshake carries a different info hash
    #[arg(long)]
    pub no_verify_info_hash: bool,
}
