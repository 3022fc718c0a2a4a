use std::collections::HashSet;

use crate::peer::PeerAddr;

pub const BLOCK_SIZE: u32 = 16384;

/// Received byte ranges of one piece, as sorted, coalesced closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRanges {
    ranges: Vec<(u32, u32)>,
}

impl BlockRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Records `[start, end]`. Returns false when it was already fully covered.
    pub fn insert(&mut self, start: u32, end: u32) -> bool {
        if self.ranges.iter().any(|&(s, e)| s <= start && end <= e) {
            return false;
        }
        self.ranges.push((start, end));
        self.ranges.sort_unstable_by_key(|&(s, _)| s);

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
        true
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn received(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(s, e)| (e - s) as u64 + 1)
            .sum()
    }

    pub fn is_complete(&self, piece_size: u32) -> bool {
        piece_size > 0 && self.ranges == [(0, piece_size - 1)]
    }

    /// Lowest-offset gap as `(begin, length)`, bounded by [`BLOCK_SIZE`].
    pub fn next_gap(&self, piece_size: u32) -> Option<(u32, u32)> {
        let (begin, end) = match self.ranges.as_slice() {
            [] => (0, piece_size),
            [(first, _), ..] if *first > 0 => (0, *first),
            [(_, e0), (s1, _), ..] => (e0 + 1, *s1),
            [(_, e0)] => (e0 + 1, piece_size),
        };
        if begin >= end {
            return None;
        }
        Some((begin, (end - begin).min(BLOCK_SIZE)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    NotFound,
    Waiting,
    Assigned,
    Complete,
}

#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    pub hash: [u8; 20],
    pub size: u32,
    status: PieceStatus,
    owners: HashSet<PeerAddr>,
    assigned: HashSet<PeerAddr>,
    buf: Vec<u8>,
    ranges: BlockRanges,
}

impl Piece {
    pub fn new(index: u32, hash: [u8; 20], size: u32) -> Self {
        Self {
            index,
            hash,
            size,
            status: PieceStatus::NotFound,
            owners: HashSet::new(),
            assigned: HashSet::new(),
            buf: Vec::new(),
            ranges: BlockRanges::new(),
        }
    }

    pub fn status(&self) -> PieceStatus {
        self.status
    }

    pub fn owners(&self) -> &HashSet<PeerAddr> {
        &self.owners
    }

    pub fn assigned_peers(&self) -> &HashSet<PeerAddr> {
        &self.assigned
    }

    pub fn ranges(&self) -> &BlockRanges {
        &self.ranges
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    fn refresh_status(&mut self) {
        if self.status == PieceStatus::Complete {
            return;
        }
        self.status = if !self.assigned.is_empty() {
            PieceStatus::Assigned
        } else if !self.owners.is_empty() {
            PieceStatus::Waiting
        } else {
            PieceStatus::NotFound
        };
    }

    pub fn add_owner(&mut self, peer: PeerAddr) {
        self.owners.insert(peer);
        self.refresh_status();
    }

    pub fn remove_owner(&mut self, peer: &PeerAddr) {
        self.owners.remove(peer);
        self.refresh_status();
    }

    pub fn set_owners(&mut self, owners: HashSet<PeerAddr>) {
        self.owners = owners;
        self.refresh_status();
    }

    pub fn assign_peer(&mut self, peer: PeerAddr) {
        if self.buf.len() != self.size as usize {
            self.buf = vec![0u8; self.size as usize];
        }
        self.assigned.insert(peer);
        self.refresh_status();
    }

    /// Drops `peer`'s assignment; progress and the buffer are discarded once nobody is assigned.
    pub fn remove_assigned_peer(&mut self, peer: &PeerAddr) {
        if self.assigned.remove(peer) && self.assigned.is_empty() {
            self.ranges.clear();
            self.buf = Vec::new();
        }
        self.refresh_status();
    }

    pub fn is_assigned_to(&self, peer: &PeerAddr) -> bool {
        self.assigned.contains(peer)
    }

    /// Copies a block into the buffer. Returns false for duplicates or out-of-range blocks.
    pub fn write_block(&mut self, begin: u32, data: &[u8]) -> bool {
        let end = begin as usize + data.len();
        if data.is_empty() || end > self.buf.len() {
            return false;
        }
        if !self.ranges.insert(begin, end as u32 - 1) {
            return false;
        }
        self.buf[begin as usize..end].copy_from_slice(data);
        true
    }

    pub fn is_filled(&self) -> bool {
        self.ranges.is_complete(self.size)
    }

    /// Moves the buffer out for hashing. Further blocks are ignored until it is restored.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Marks the piece complete and drops its buffer. Only the first call returns true.
    pub fn complete(&mut self) -> bool {
        if self.status == PieceStatus::Complete {
            return false;
        }
        self.status = PieceStatus::Complete;
        self.assigned.clear();
        self.ranges.clear();
        self.buf = Vec::new();
        true
    }

    /// Puts a buffer that failed its hash check back so `peer` restarts the piece from offset 0.
    /// Returns false when `peer` lost the piece in the meantime.
    pub fn restore_after_mismatch(&mut self, peer: &PeerAddr, buf: Vec<u8>) -> bool {
        if !self.is_assigned_to(peer) || !self.buf.is_empty() || buf.len() != self.size as usize {
            return false;
        }
        self.buf = buf;
        self.ranges.clear();
        true
    }
}
