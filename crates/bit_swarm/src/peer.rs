use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub type PeerAddr = SocketAddr;

/// Decodes compact IPv4 peers: 4 address bytes then a big-endian port, 6 bytes per peer.
pub fn from_compact_v4(peers_bin: &[u8]) -> Option<Vec<PeerAddr>> {
    if peers_bin.len() % 6 != 0 {
        return None;
    }
    Some(
        peers_bin
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect(),
    )
}

pub fn from_ipv6_record(ip: &[u8], port: u16) -> Option<PeerAddr> {
    let octets: [u8; 16] = ip.try_into().ok()?;
    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
}
