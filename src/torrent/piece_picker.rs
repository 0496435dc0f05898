//! Piece selection: rarest-first with endgame and optional sequential mode.
//!
//! The picker tracks piece availability across the swarm and which pieces
//! are already being assembled. It hands out piece indices; block-level
//! bookkeeping lives with the session's assemblies.

use bitvec::prelude::{BitSlice, BitVec, Msb0};
use rand::seq::SliceRandom;

/// Endgame activates when fewer than this many pieces are still missing.
const ENDGAME_PIECE_THRESHOLD: usize = 8;

/// Wire-order bitfield over the torrent's pieces.
pub type PieceBits = BitVec<u8, Msb0>;

#[derive(Debug)]
pub struct PiecePicker {
    piece_count: usize,
    /// Verified-and-persisted pieces.
    have: PieceBits,
    /// Pieces with an active assembly.
    inflight: PieceBits,
    /// How many known peers have each piece.
    availability: Vec<u32>,
    /// Pieces covered by selected files; deselected pieces are never
    /// picked and do not count toward completion.
    wanted: PieceBits,
    /// Sequential mode disables rarest-first (user opt-in).
    sequential: bool,
    endgame_enabled: bool,
}

impl PiecePicker {
    #[must_use]
    pub fn new(piece_count: usize, sequential: bool, endgame_enabled: bool) -> Self {
        let mut have = PieceBits::new();
        have.resize(piece_count, false);
        let mut inflight = PieceBits::new();
        inflight.resize(piece_count, false);
        let mut wanted = PieceBits::new();
        wanted.resize(piece_count, true);
        Self {
            piece_count,
            have,
            inflight,
            availability: vec![0; piece_count],
            wanted,
            sequential,
            endgame_enabled,
        }
    }

    /// Replaces the wanted mask (file selection). Pieces outside the mask
    /// are never picked and do not block completion.
    pub fn set_wanted(&mut self, wanted: &PieceBits) {
        for index in 0..self.piece_count {
            let flag = wanted.get(index).map(|b| *b).unwrap_or(true);
            self.wanted.set(index, flag);
        }
    }

    /// Restores the have set from a packed wire-order bitfield.
    pub fn restore_have(&mut self, packed: &[u8]) {
        let bits = BitVec::<u8, Msb0>::from_slice(packed);
        for index in 0..self.piece_count.min(bits.len()) {
            if bits[index] {
                self.have.set(index, true);
            }
        }
    }

    /// Registers a newly connected peer's bitfield.
    pub fn peer_connected(&mut self, peer_bits: &BitSlice<u8, Msb0>) {
        for index in 0..self.piece_count.min(peer_bits.len()) {
            if peer_bits[index] {
                self.availability[index] += 1;
            }
        }
    }

    /// Registers a `have` announcement from a peer.
    pub fn peer_has(&mut self, index: usize) {
        if index < self.piece_count {
            self.availability[index] += 1;
        }
    }

    /// Removes a disconnected peer's contribution to availability.
    pub fn peer_disconnected(&mut self, peer_bits: &BitSlice<u8, Msb0>) {
        for index in 0..self.piece_count.min(peer_bits.len()) {
            if peer_bits[index] {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
    }

    /// Picks the next piece to assemble for a peer with the given bitfield.
    ///
    /// Normal mode skips in-flight pieces; in endgame the same piece may be
    /// handed to multiple peers. Rarest availability wins, ties break
    /// randomly; sequential mode picks the lowest index instead.
    pub fn pick(&mut self, peer_bits: &BitSlice<u8, Msb0>) -> Option<usize> {
        let pick = self.pick_candidate(peer_bits, false);
        let pick = match pick {
            Some(index) => Some(index),
            None if self.in_endgame() => self.pick_candidate(peer_bits, true),
            None => None,
        }?;
        self.inflight.set(pick, true);
        Some(pick)
    }

    fn pick_candidate(&self, peer_bits: &BitSlice<u8, Msb0>, allow_inflight: bool) -> Option<usize> {
        let candidates = (0..self.piece_count).filter(|&i| {
            self.wanted[i]
                && !self.have[i]
                && (allow_inflight || !self.inflight[i])
                && peer_bits.get(i).map(|b| *b).unwrap_or(false)
        });

        if self.sequential {
            return candidates.min();
        }

        let mut best: Vec<usize> = Vec::new();
        let mut best_avail = u32::MAX;
        for index in candidates {
            let avail = self.availability[index];
            if avail < best_avail {
                best_avail = avail;
                best.clear();
                best.push(index);
            } else if avail == best_avail {
                best.push(index);
            }
        }
        best.choose(&mut rand::thread_rng()).copied()
    }

    /// Marks a piece verified and persisted.
    pub fn mark_have(&mut self, index: usize) {
        if index < self.piece_count {
            self.have.set(index, true);
            self.inflight.set(index, false);
        }
    }

    /// Returns a failed or abandoned piece to the candidate pool.
    pub fn requeue(&mut self, index: usize) {
        if index < self.piece_count {
            self.inflight.set(index, false);
        }
    }

    /// Demotes a piece whose on-disk bytes no longer verify.
    pub fn mark_lost(&mut self, index: usize) {
        if index < self.piece_count {
            self.have.set(index, false);
            self.inflight.set(index, false);
        }
    }

    /// True once every wanted piece is had.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Wanted pieces still missing.
    #[must_use]
    pub fn remaining(&self) -> usize {
        (0..self.piece_count).filter(|&i| self.wanted[i] && !self.have[i]).count()
    }

    #[must_use]
    pub fn has_piece(&self, index: usize) -> bool {
        self.have.get(index).map(|b| *b).unwrap_or(false)
    }

    /// True when endgame duplication is active.
    #[must_use]
    pub fn in_endgame(&self) -> bool {
        self.endgame_enabled && self.remaining() > 0 && self.remaining() < ENDGAME_PIECE_THRESHOLD
    }

    /// True when the peer has at least one piece we still need.
    #[must_use]
    pub fn is_interesting(&self, peer_bits: &BitSlice<u8, Msb0>) -> bool {
        (0..self.piece_count.min(peer_bits.len()))
            .any(|i| peer_bits[i] && self.wanted[i] && !self.have[i])
    }

    /// Packed wire-order have-bitfield (for `bitfield` messages and
    /// persistence).
    #[must_use]
    pub fn have_bitfield(&self) -> Vec<u8> {
        let mut bits = self.have.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }
}
