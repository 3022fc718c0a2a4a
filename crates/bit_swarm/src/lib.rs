pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod disk;
pub mod file;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod peer_connection;
pub mod peer_state;
pub mod piece;
pub mod piece_registry;
pub mod protocol;
pub mod swarm;
pub mod tracker;
pub mod utils;
