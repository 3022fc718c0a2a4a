use std::collections::HashSet;

use tracing::{debug, warn};

use crate::{
    bitfield::Bitfield,
    file::TorrentMeta,
    message::{BlockRequest, PieceBlock},
    peer::PeerAddr,
    piece::{Piece, PieceStatus},
};

/// A piece whose hash matched, ready for the disk writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPiece {
    pub index: u32,
    pub buf: Vec<u8>,
}

/// A piece whose last block just arrived, moved out of the registry for hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledPiece {
    pub index: u32,
    pub hash: [u8; 20],
    pub buf: Vec<u8>,
}

impl FilledPiece {
    pub fn verify(&self) -> bool {
        crate::utils::check_integrity(&self.hash, &self.buf)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was stored; the piece still has gaps.
    Progress { received: u64, size: u32 },
    /// Already received, outside the piece, or for a piece this peer isn't assigned.
    Ignored,
    /// Every byte is in; hash it and hand it back through [`PieceRegistry::finish_piece`].
    Filled(FilledPiece),
}

/// Per-piece state for one torrent.
#[derive(Debug)]
pub struct PieceRegistry {
    pieces: Vec<Piece>,
}

impl PieceRegistry {
    pub fn new(meta: &TorrentMeta) -> Self {
        let pieces = meta
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(index as u32, *hash, meta.piece_size(index)))
            .collect();
        Self { pieces }
    }

    pub fn from_pieces(pieces: Vec<Piece>) -> Self {
        Self { pieces }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn count(&self, status: PieceStatus) -> usize {
        self.pieces.iter().filter(|p| p.status() == status).count()
    }

    /// Pieces nobody is working on yet and that aren't done.
    pub fn unassigned(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p.status(), PieceStatus::NotFound | PieceStatus::Waiting))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces
            .iter()
            .all(|p| p.status() == PieceStatus::Complete)
    }

    /// Recomputes every piece's owner set from the connected peers' bitfields.
    pub fn aggregate_bitfields(&mut self, peers: &[(PeerAddr, Bitfield)]) {
        for piece in self.pieces.iter_mut() {
            let owners: HashSet<PeerAddr> = peers
                .iter()
                .filter(|(_, bitfield)| bitfield.has_piece(piece.index as usize))
                .map(|(addr, _)| *addr)
                .collect();
            piece.set_owners(owners);
        }
    }

    pub fn add_owner(&mut self, index: usize, peer: PeerAddr) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.add_owner(peer);
        }
    }

    /// Rarest-first: among unassigned, incomplete pieces `bitfield` covers, the one with the
    /// fewest owners; ties go to the lowest index.
    pub fn assign_next_piece(&mut self, peer: PeerAddr, bitfield: &Bitfield) -> Option<u32> {
        let piece = self
            .pieces
            .iter_mut()
            .filter(|p| matches!(p.status(), PieceStatus::NotFound | PieceStatus::Waiting))
            .filter(|p| bitfield.has_piece(p.index as usize))
            .min_by_key(|p| (p.owners().len(), p.index))?;
        piece.assign_peer(peer);
        debug!(
            "{} assigned piece {} ({} owners)",
            peer,
            piece.index,
            piece.owners().len()
        );
        Some(piece.index)
    }

    /// Next block to ask `peer` for on piece `index`, if it is still assigned to them.
    pub fn next_request(&self, peer: &PeerAddr, index: u32) -> Option<BlockRequest> {
        let piece = self.pieces.get(index as usize)?;
        if !piece.is_assigned_to(peer) {
            return None;
        }
        let (begin, length) = piece.ranges().next_gap(piece.size)?;
        Some(BlockRequest {
            index,
            begin,
            length,
        })
    }

    pub fn receive_block(&mut self, peer: &PeerAddr, block: &PieceBlock) -> BlockOutcome {
        let Some(piece) = self.pieces.get_mut(block.index as usize) else {
            return BlockOutcome::Ignored;
        };
        if !piece.is_assigned_to(peer) || !piece.write_block(block.begin, &block.data) {
            return BlockOutcome::Ignored;
        }
        if !piece.is_filled() {
            return BlockOutcome::Progress {
                received: piece.ranges().received(),
                size: piece.size,
            };
        }
        BlockOutcome::Filled(FilledPiece {
            index: piece.index,
            hash: piece.hash,
            buf: piece.take_buffer(),
        })
    }

    /// Applies the hash check of a [`FilledPiece`]. A match completes the piece and yields it for
    /// the disk writer; a mismatch restarts it from offset 0 for `peer`.
    pub fn finish_piece(
        &mut self,
        peer: &PeerAddr,
        filled: FilledPiece,
        matched: bool,
    ) -> Option<VerifiedPiece> {
        let piece = self.pieces.get_mut(filled.index as usize)?;
        if matched {
            return piece.complete().then(|| VerifiedPiece {
                index: filled.index,
                buf: filled.buf,
            });
        }
        warn!(
            "hash mismatch on piece {} from {}, expected {}",
            filled.index,
            peer,
            hex(&filled.hash)
        );
        if !piece.restore_after_mismatch(peer, filled.buf) {
            debug!("{} lost piece {} while it was hashed", peer, filled.index);
        }
        None
    }

    /// Forgets everything `peer` contributed: its ownership and any assignment.
    pub fn release_peer(&mut self, peer: &PeerAddr) {
        for piece in self.pieces.iter_mut() {
            piece.remove_assigned_peer(peer);
            piece.remove_owner(peer);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
