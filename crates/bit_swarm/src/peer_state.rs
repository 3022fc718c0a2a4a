use dashmap::DashMap;

use crate::{bitfield::Bitfield, peer::PeerAddr};

/// Bitfields advertised by connected peers.
#[derive(Debug, Default)]
pub struct PeerStates {
    pub states: DashMap<PeerAddr, PeerState>,
}

impl PeerStates {
    pub fn add_if_not_seen(&self, peer: PeerAddr, num_pieces: usize) {
        self.states
            .entry(peer)
            .or_insert_with(|| PeerState::new(num_pieces));
    }

    pub fn set_bitfield(&self, peer: PeerAddr, bitfield: Bitfield) {
        let num_pieces = bitfield.len();
        self.states
            .entry(peer)
            .or_insert_with(|| PeerState::new(num_pieces))
            .bitfield = bitfield;
    }

    /// Returns false when the peer is unknown or already had the piece.
    pub fn set_piece(&self, peer: PeerAddr, index: usize) -> bool {
        match self.states.get_mut(&peer) {
            Some(mut state) if !state.bitfield.has_piece(index) => {
                state.bitfield.set_piece(index);
                state.bitfield.has_piece(index)
            }
            _ => false,
        }
    }

    pub fn bitfield(&self, peer: &PeerAddr) -> Option<Bitfield> {
        self.states.get(peer).map(|state| state.bitfield.clone())
    }

    pub fn remove(&self, peer: &PeerAddr) {
        self.states.remove(peer);
    }

    pub fn snapshot(&self) -> Vec<(PeerAddr, Bitfield)> {
        self.states
            .iter()
            .map(|entry| (*entry.key(), entry.value().bitfield.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PeerState {
    /// This is used to track the pieces the peer has.
    pub bitfield: Bitfield,
}

impl PeerState {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bitfield: Bitfield::new(num_pieces),
        }
    }
}
