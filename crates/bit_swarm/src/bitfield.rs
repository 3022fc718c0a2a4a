/// Pieces a peer advertises, MSB-first: bit 7 of byte 0 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Bitfield {
        Bitfield {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Builds a bitfield from a peer's wire payload, truncating or padding it to `num_pieces`.
    pub fn from_bytes(payload: &[u8], num_pieces: usize) -> Bitfield {
        let mut bitfield = Bitfield::new(num_pieces);
        let n = bitfield.bytes.len().min(payload.len());
        bitfield.bytes[..n].copy_from_slice(&payload[..n]);
        let spare = bitfield.bytes.len() * 8 - num_pieces;
        if spare > 0 {
            if let Some(last) = bitfield.bytes.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
        bitfield
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte_index = index / 8;
        let offset = index % 8;
        (self.bytes[byte_index] >> (7 - offset)) & 1 != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        let byte_index = index / 8;
        let offset = index % 8;
        self.bytes[byte_index] |= 1 << (7 - offset);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&x| x == 0)
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(|&i| self.has_piece(i))
    }
}
