//! The piece picker holds the authoritative piece state map of a torrent and
//! decides which piece to download next, based on the configured selection
//! strategy and the availability of pieces across connected peers.

use crate::{error::*, Bitfield, PieceIndex};

/// The state of a single piece.
///
/// Legal transitions: `Missing → Downloading → (Verified | Failed)` and
/// `Failed → Missing` when the piece is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceState {
    /// We don't have the piece and no peer session is downloading it.
    Missing,
    /// At least one peer session has requested blocks of this piece.
    Downloading,
    /// The piece's SHA-1 hash matched and its blocks are on disk.
    Verified,
    /// The last download of this piece produced a hash mismatch. The piece is
    /// eligible to be picked again.
    Failed,
}

/// How the next piece to download is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Among the missing pieces at least one connected peer has, pick the one
    /// with the lowest availability, breaking ties by lower index. The
    /// default: it maximizes swarm health.
    RarestFirst,
    /// Pick the lowest indexed missing piece. Used when the download order
    /// matters more than the swarm.
    Sequential,
    /// Sequential within a sliding window ahead of the playback hint; rarest
    /// first outside of it.
    Streaming,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::RarestFirst => "rarest-first",
            Self::Sequential => "sequential",
            Self::Streaming => "streaming",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rarest-first" => Some(Self::RarestFirst),
            "sequential" => Some(Self::Sequential),
            "streaming" => Some(Self::Streaming),
            _ => None,
        }
    }
}

/// Internal per-piece bookkeeping.
#[derive(Clone, Copy, Debug)]
struct Piece {
    state: PieceState,
    /// The number of connected peers whose bitfield has this piece set.
    /// Updated on bitfield receipt, HAVE messages, and peer disconnect.
    availability: usize,
    /// How many times a completed download of this piece failed its hash
    /// check.
    failure_count: u8,
}

impl Default for Piece {
    fn default() -> Self {
        Self {
            state: PieceState::Missing,
            availability: 0,
            failure_count: 0,
        }
    }
}

pub(crate) struct PiecePicker {
    pieces: Vec<Piece>,
    /// The pieces we have verified, in the format we announce to peers.
    own_pieces: Bitfield,
    /// The pieces the user wants at all. Deselected files exclude their
    /// exclusive pieces from selection, but pieces we already have are still
    /// served.
    wanted: Bitfield,
    strategy: Strategy,
    /// The size of the streaming strategy's sliding window, in pieces.
    window_size: usize,
    /// The first piece of the streaming window (the playback hint).
    window_start: PieceIndex,
    /// When at most this many wanted pieces are missing or downloading, the
    /// torrent is in endgame.
    endgame_threshold: usize,
}

impl PiecePicker {
    pub fn new(
        piece_count: usize,
        strategy: Strategy,
        window_size: usize,
        endgame_threshold: usize,
    ) -> Self {
        let mut own_pieces = Bitfield::new();
        own_pieces.resize(piece_count, false);
        let mut wanted = Bitfield::new();
        wanted.resize(piece_count, true);
        Self {
            pieces: vec![Piece::default(); piece_count],
            own_pieces,
            wanted,
            strategy,
            window_size,
            window_start: 0,
            endgame_threshold,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The pieces we have, as announced in our bitfield message.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn piece_state(&self, index: PieceIndex) -> Result<PieceState> {
        self.pieces
            .get(index)
            .map(|piece| piece.state)
            .ok_or(Error::InvalidPieceIndex)
    }

    /// The number of peers that have the piece, across all connected peers.
    pub fn piece_availability(&self, index: PieceIndex) -> Result<usize> {
        self.pieces
            .get(index)
            .map(|piece| piece.availability)
            .ok_or(Error::InvalidPieceIndex)
    }

    pub fn verified_count(&self) -> usize {
        self.own_pieces.count_ones()
    }

    /// The number of wanted pieces that are not yet verified.
    pub fn missing_count(&self) -> usize {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                self.wanted[*index] && piece.state != PieceState::Verified
            })
            .count()
    }

    /// Returns true if every wanted piece is verified.
    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Returns whether a peer with the given pieces has anything we still
    /// want.
    pub fn is_interested_in(&self, peer_pieces: &Bitfield) -> bool {
        if peer_pieces.len() != self.pieces.len() {
            return false;
        }
        (0..self.pieces.len()).any(|index| {
            peer_pieces[index] && self.wanted[index] && !self.own_pieces[index]
        })
    }

    /// Registers the pieces of a newly received peer bitfield and returns
    /// whether the peer has any piece we are interested in.
    ///
    /// The bitfield must already be resized to the torrent's piece count.
    pub fn register_availability(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Result<bool> {
        if peer_pieces.len() != self.pieces.len() {
            return Err(Error::ProtocolViolation("bitfield of wrong size"));
        }
        let mut interested = false;
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if peer_pieces[index] {
                piece.availability += 1;
                if self.wanted[index] && !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Removes a disconnected peer's pieces from the availability counters.
    pub fn unregister_availability(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Result<()> {
        if peer_pieces.len() != self.pieces.len() {
            return Err(Error::ProtocolViolation("bitfield of wrong size"));
        }
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if peer_pieces[index] {
                debug_assert!(piece.availability > 0);
                piece.availability = piece.availability.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Registers a HAVE announcement from a peer and returns whether the
    /// piece makes the peer interesting.
    pub fn register_have(&mut self, index: PieceIndex) -> Result<bool> {
        let wanted = self.wanted.get(index).map(|b| *b).unwrap_or(false);
        let own = self.own_pieces.get(index).map(|b| *b).unwrap_or(false);
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidPieceIndex)?;
        piece.availability += 1;
        Ok(wanted && !own)
    }

    /// Picks the next piece to download from a peer with the given pieces,
    /// under the active strategy, and marks it as downloading. Returns `None`
    /// if the peer has no piece we can start.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Option<PieceIndex> {
        let index = match self.strategy {
            Strategy::RarestFirst => self.pick_rarest(peer_pieces, 0, None),
            Strategy::Sequential => self.pick_sequential(peer_pieces, 0, None),
            Strategy::Streaming => {
                let window_end = self.window_start + self.window_size;
                self.pick_sequential(
                    peer_pieces,
                    self.window_start,
                    Some(window_end),
                )
                .or_else(|| self.pick_rarest(peer_pieces, 0, None))
            }
        }?;
        self.pieces[index].state = PieceState::Downloading;
        Some(index)
    }

    fn is_pickable(&self, index: PieceIndex, peer_pieces: &Bitfield) -> bool {
        self.wanted[index]
            && peer_pieces[index]
            && matches!(
                self.pieces[index].state,
                PieceState::Missing | PieceState::Failed
            )
    }

    fn pick_rarest(
        &self,
        peer_pieces: &Bitfield,
        start: PieceIndex,
        end: Option<PieceIndex>,
    ) -> Option<PieceIndex> {
        let end = end.unwrap_or(self.pieces.len()).min(self.pieces.len());
        let mut best: Option<(PieceIndex, usize)> = None;
        for index in start..end {
            if !self.is_pickable(index, peer_pieces) {
                continue;
            }
            let availability = self.pieces[index].availability;
            // strict comparison keeps the lowest index among ties
            if best.map(|(_, a)| availability < a).unwrap_or(true) {
                best = Some((index, availability));
            }
        }
        best.map(|(index, _)| index)
    }

    fn pick_sequential(
        &self,
        peer_pieces: &Bitfield,
        start: PieceIndex,
        end: Option<PieceIndex>,
    ) -> Option<PieceIndex> {
        let end = end.unwrap_or(self.pieces.len()).min(self.pieces.len());
        (start..end).find(|&index| self.is_pickable(index, peer_pieces))
    }

    /// Returns true when at most `endgame_threshold` wanted pieces remain
    /// unverified, which is when outstanding requests are duplicated across
    /// every peer that has them.
    pub fn is_endgame(&self) -> bool {
        let remaining = self.missing_count();
        remaining > 0 && remaining <= self.endgame_threshold
    }

    /// The pieces currently being downloaded that the given peer also has;
    /// used to duplicate requests in endgame.
    pub fn downloading_pieces_of(
        &self,
        peer_pieces: &Bitfield,
    ) -> Vec<PieceIndex> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                piece.state == PieceState::Downloading && peer_pieces[*index]
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Marks a piece as verified after its hash check passed and its blocks
    /// were handed to the disk task.
    pub fn received_piece(&mut self, index: PieceIndex) -> Result<()> {
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidPieceIndex)?;
        piece.state = PieceState::Verified;
        self.own_pieces.set(index, true);
        Ok(())
    }

    /// Records a hash check failure of a completed piece and returns the
    /// piece's total failure count. The piece becomes eligible for retry.
    pub fn piece_failed(&mut self, index: PieceIndex) -> Result<u8> {
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidPieceIndex)?;
        debug_assert!(piece.state != PieceState::Verified);
        piece.state = PieceState::Failed;
        piece.failure_count = piece.failure_count.saturating_add(1);
        Ok(piece.failure_count)
    }

    /// Returns a downloading piece to the missing pool, when the only peer
    /// downloading it disconnected.
    pub fn abandon_piece(&mut self, index: PieceIndex) -> Result<()> {
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidPieceIndex)?;
        if piece.state == PieceState::Downloading {
            piece.state = PieceState::Missing;
        }
        Ok(())
    }

    /// Marks the listed pieces as verified without downloading, as part of
    /// resuming from a checkpoint. Remaining pieces stay missing.
    pub fn restore_verified(&mut self, indices: &[PieceIndex]) -> Result<()> {
        for &index in indices {
            self.received_piece(index)?;
        }
        Ok(())
    }

    /// Demotes a verified piece back to missing; used when resume
    /// verification finds the data on disk no longer matches.
    pub fn demote(&mut self, index: PieceIndex) -> Result<()> {
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidPieceIndex)?;
        piece.state = PieceState::Missing;
        self.own_pieces.set(index, false);
        Ok(())
    }

    /// Installs a new wanted-piece mask computed from the user's file
    /// selection.
    pub fn set_wanted_pieces(&mut self, wanted: Bitfield) -> Result<()> {
        if wanted.len() != self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        self.wanted = wanted;
        Ok(())
    }

    /// Moves the streaming window to start at the given piece.
    pub fn set_playback_hint(&mut self, index: PieceIndex) {
        self.window_start = index.min(self.pieces.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield(piece_count: usize, have: &[PieceIndex]) -> Bitfield {
        let mut pieces = Bitfield::new();
        pieces.resize(piece_count, false);
        for &index in have {
            pieces.set(index, true);
        }
        pieces
    }

    fn full_bitfield(piece_count: usize) -> Bitfield {
        let mut pieces = Bitfield::new();
        pieces.resize(piece_count, true);
        pieces
    }

    fn picker(piece_count: usize, strategy: Strategy) -> PiecePicker {
        PiecePicker::new(piece_count, strategy, 4, 3)
    }

    #[test]
    fn test_rarest_first_prefers_lowest_availability() {
        let mut picker = picker(8, Strategy::RarestFirst);
        // five peers have every piece except piece 5, which only one has
        let rare_holder = full_bitfield(8);
        picker.register_availability(&rare_holder).unwrap();
        for _ in 0..4 {
            let common = {
                let mut b = full_bitfield(8);
                b.set(5, false);
                b
            };
            picker.register_availability(&common).unwrap();
        }
        // a peer that has the rare piece must be asked for it first
        assert_eq!(picker.pick_piece(&rare_holder), Some(5));
        // the piece is now downloading and is not picked again
        assert_ne!(picker.pick_piece(&rare_holder), Some(5));
    }

    #[test]
    fn test_rarest_first_breaks_ties_by_lower_index() {
        let mut picker = picker(4, Strategy::RarestFirst);
        let peer = full_bitfield(4);
        picker.register_availability(&peer).unwrap();
        assert_eq!(picker.pick_piece(&peer), Some(0));
        assert_eq!(picker.pick_piece(&peer), Some(1));
    }

    #[test]
    fn test_pick_skips_pieces_peer_lacks() {
        let mut picker = picker(4, Strategy::Sequential);
        let peer = bitfield(4, &[2, 3]);
        picker.register_availability(&peer).unwrap();
        assert_eq!(picker.pick_piece(&peer), Some(2));
        assert_eq!(picker.pick_piece(&peer), Some(3));
        assert_eq!(picker.pick_piece(&peer), None);
    }

    #[test]
    fn test_streaming_window_then_rarest() {
        let mut picker = picker(16, Strategy::Streaming);
        let peer = full_bitfield(16);
        picker.register_availability(&peer).unwrap();
        picker.set_playback_hint(8);
        // inside the window of 4 starting at the hint
        assert_eq!(picker.pick_piece(&peer), Some(8));
        assert_eq!(picker.pick_piece(&peer), Some(9));
        assert_eq!(picker.pick_piece(&peer), Some(10));
        assert_eq!(picker.pick_piece(&peer), Some(11));
        // window exhausted, falls back to rarest-first from the start
        assert_eq!(picker.pick_piece(&peer), Some(0));
    }

    #[test]
    fn test_availability_counters_follow_bitfields() {
        let mut picker = picker(4, Strategy::RarestFirst);
        let a = bitfield(4, &[0, 1]);
        let b = bitfield(4, &[1, 2]);
        picker.register_availability(&a).unwrap();
        picker.register_availability(&b).unwrap();
        assert_eq!(picker.piece_availability(0).unwrap(), 1);
        assert_eq!(picker.piece_availability(1).unwrap(), 2);
        assert_eq!(picker.piece_availability(3).unwrap(), 0);
        picker.register_have(3).unwrap();
        assert_eq!(picker.piece_availability(3).unwrap(), 1);
        picker.unregister_availability(&a).unwrap();
        assert_eq!(picker.piece_availability(0).unwrap(), 0);
        assert_eq!(picker.piece_availability(1).unwrap(), 1);
    }

    #[test]
    fn test_wrong_size_bitfield_rejected() {
        let mut picker = picker(4, Strategy::RarestFirst);
        let wrong = full_bitfield(5);
        assert!(picker.register_availability(&wrong).is_err());
    }

    #[test]
    fn test_failed_piece_is_retried() {
        let mut picker = picker(2, Strategy::Sequential);
        let peer = full_bitfield(2);
        picker.register_availability(&peer).unwrap();
        assert_eq!(picker.pick_piece(&peer), Some(0));
        assert_eq!(picker.piece_failed(0).unwrap(), 1);
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::Failed);
        // the failed piece can be picked again
        assert_eq!(picker.pick_piece(&peer), Some(0));
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::Downloading);
    }

    #[test]
    fn test_verified_monotone_and_complete() {
        let mut picker = picker(3, Strategy::Sequential);
        picker.restore_verified(&[0, 2]).unwrap();
        assert_eq!(picker.verified_count(), 2);
        assert!(!picker.is_complete());
        picker.received_piece(1).unwrap();
        assert!(picker.is_complete());
        assert!(picker.own_pieces().all());
    }

    #[test]
    fn test_endgame_threshold() {
        let mut picker = picker(5, Strategy::Sequential);
        picker.restore_verified(&[0, 1]).unwrap();
        assert!(picker.is_endgame());
        let peer = full_bitfield(5);
        picker.register_availability(&peer).unwrap();
        let index = picker.pick_piece(&peer).unwrap();
        assert!(picker
            .downloading_pieces_of(&peer)
            .contains(&index));
    }

    #[test]
    fn test_deselected_pieces_not_picked() {
        let mut picker = picker(4, Strategy::Sequential);
        let peer = full_bitfield(4);
        picker.register_availability(&peer).unwrap();
        picker
            .set_wanted_pieces(bitfield(4, &[1, 3]))
            .unwrap();
        assert_eq!(picker.pick_piece(&peer), Some(1));
        assert_eq!(picker.pick_piece(&peer), Some(3));
        assert_eq!(picker.pick_piece(&peer), None);
        // completion only counts wanted pieces
        picker.received_piece(1).unwrap();
        picker.received_piece(3).unwrap();
        assert!(picker.is_complete());
    }
}
