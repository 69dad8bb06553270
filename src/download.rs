//! Bookkeeping of a single piece's in-progress download, at block
//! granularity. The torrent shares these among its peer sessions so that
//! timed out blocks can be re-dispatched to other peers and endgame requests
//! can be duplicated.

use std::time::{Duration, Instant};

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The state of one of a piece's blocks.
#[derive(Clone, Copy, Debug, PartialEq)]
enum BlockState {
    /// No session has requested the block yet, or its request was cancelled
    /// or timed out.
    Free,
    /// A session sent a request for this block at the recorded time.
    Requested { at: Instant },
    /// The block has arrived and sits in the disk task's write buffer.
    Received,
}

/// Tracks the blocks of a single piece being downloaded.
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The state of each of the piece's blocks, in offset order.
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
        }
    }

    /// The index of the piece this download tracks.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` free blocks, marks them requested, and appends
    /// their infos to `blocks`.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let now = Instant::now();
        let mut picked = 0;
        let piece_index = self.index;
        let piece_len = self.len;
        for (index, state) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if *state == BlockState::Free {
                *state = BlockState::Requested { at: now };
                blocks.push(BlockInfo {
                    piece_index,
                    offset: index as u32 * crate::BLOCK_LEN,
                    len: block_len(piece_len, index),
                });
                picked += 1;
            }
        }
    }

    /// Endgame variant of [`pick_blocks`]: also duplicates blocks that are
    /// already requested from another peer, skipping any the caller itself
    /// has outstanding.
    ///
    /// [`pick_blocks`]: Self::pick_blocks
    pub fn pick_blocks_endgame(
        &mut self,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
        already_requested: &[BlockInfo],
    ) {
        let mut picked = 0;
        for (index, state) in self.blocks.iter().enumerate() {
            if picked == count {
                break;
            }
            if *state == BlockState::Received {
                continue;
            }
            let info = self.block_info_at(index);
            if already_requested.contains(&info) || blocks.contains(&info) {
                continue;
            }
            blocks.push(info);
            picked += 1;
        }
        // requested state (and its timestamp) is kept for the original
        // requester; duplicates don't need separate tracking
    }

    /// Marks a block as received. Returns false if the block was not pending
    /// (a duplicate from the endgame fan-out or an unrequested block), in
    /// which case the caller discards the payload.
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        debug_assert_eq!(block.piece_index, self.index);
        let index = match self.block_index_of(block) {
            Some(index) => index,
            None => return false,
        };
        match self.blocks[index] {
            BlockState::Received => false,
            _ => {
                self.blocks[index] = BlockState::Received;
                true
            }
        }
    }

    /// Returns a requested block to the free pool, to be re-dispatched
    /// (possibly to another peer).
    pub fn cancel_request(&mut self, block: &BlockInfo) {
        if let Some(index) = self.block_index_of(block) {
            if let BlockState::Requested { .. } = self.blocks[index] {
                self.blocks[index] = BlockState::Free;
            }
        }
    }

    /// Frees all blocks requested before `deadline` and appends them to
    /// `timed_out`.
    pub fn take_timed_out(
        &mut self,
        deadline: Instant,
        timed_out: &mut Vec<BlockInfo>,
    ) {
        for index in 0..self.blocks.len() {
            if let BlockState::Requested { at } = self.blocks[index] {
                if at <= deadline {
                    self.blocks[index] = BlockState::Free;
                    timed_out.push(self.block_info_at(index));
                }
            }
        }
    }

    /// The time the oldest outstanding request of this piece was made, if
    /// any.
    pub fn oldest_request(&self) -> Option<Instant> {
        self.blocks
            .iter()
            .filter_map(|state| match state {
                BlockState::Requested { at } => Some(*at),
                _ => None,
            })
            .min()
    }

    /// Returns true if no block has been received or is outstanding, i.e.
    /// the piece download hasn't effectively started. Such downloads are
    /// abandoned back to the picker when their last session disconnects.
    pub fn all_free(&self) -> bool {
        self.blocks.iter().all(|state| *state == BlockState::Free)
    }

    /// Returns the number of blocks of this piece that have not arrived yet.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|state| !matches!(state, BlockState::Received))
            .count()
    }

    /// Returns true if the given block's offset and length are exactly one of
    /// this piece's blocks.
    pub fn is_valid_block(&self, block: &BlockInfo) -> bool {
        self.block_index_of(block).is_some()
    }

    /// How long a timeout check needs to wait for the given request age
    /// before it fires; a helper for the caller's tick scheduling.
    pub fn request_age(&self, block: &BlockInfo) -> Option<Duration> {
        let index = self.block_index_of(block)?;
        match self.blocks[index] {
            BlockState::Requested { at } => Some(at.elapsed()),
            _ => None,
        }
    }

    fn block_info_at(&self, index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: index as u32 * crate::BLOCK_LEN,
            len: block_len(self.len, index),
        }
    }

    fn block_index_of(&self, block: &BlockInfo) -> Option<usize> {
        if block.piece_index != self.index
            || block.offset % crate::BLOCK_LEN != 0
        {
            return None;
        }
        let index = (block.offset / crate::BLOCK_LEN) as usize;
        if index >= self.blocks.len() || block.len != block_len(self.len, index)
        {
            return None;
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    // a piece of two whole blocks and a 100 byte tail block
    const PIECE_LEN: u32 = 2 * BLOCK_LEN + 100;

    #[test]
    fn test_pick_blocks_in_offset_order() {
        let mut download = PieceDownload::new(3, PIECE_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_LEN);
        assert_eq!(blocks[1].len, BLOCK_LEN);

        // the last block is short
        blocks.clear();
        download.pick_blocks(5, &mut blocks);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 2 * BLOCK_LEN);
        assert_eq!(blocks[0].len, 100);

        // everything is requested now
        blocks.clear();
        download.pick_blocks(5, &mut blocks);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_received_block_and_duplicates() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(3, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 3);

        assert!(download.received_block(&blocks[0]));
        // the same block again is a duplicate
        assert!(!download.received_block(&blocks[0]));
        assert_eq!(download.count_missing_blocks(), 2);

        // a block with a bogus length is not accepted
        let bogus = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: 5,
        };
        assert!(!download.received_block(&bogus));

        assert!(download.received_block(&blocks[1]));
        assert!(download.received_block(&blocks[2]));
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn test_cancel_request_frees_block() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        download.cancel_request(&blocks[0]);
        let mut again = Vec::new();
        download.pick_blocks(1, &mut again);
        assert_eq!(blocks, again);
    }

    #[test]
    fn test_take_timed_out() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(3, &mut blocks);
        download.received_block(&blocks[0]);

        // everything requested so far is older than "now"
        let mut timed_out = Vec::new();
        download.take_timed_out(Instant::now(), &mut timed_out);
        assert_eq!(timed_out, vec![blocks[1], blocks[2]]);
        // the freed blocks are pickable again
        let mut again = Vec::new();
        download.pick_blocks(5, &mut again);
        assert_eq!(again, vec![blocks[1], blocks[2]]);
    }

    #[test]
    fn test_endgame_duplicates_requested_blocks() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut first_peer = Vec::new();
        download.pick_blocks(3, &mut first_peer);

        // a second peer duplicates the outstanding blocks, but not the ones
        // it already requested itself
        let mut second_peer = Vec::new();
        download.pick_blocks_endgame(5, &mut second_peer, &[]);
        assert_eq!(second_peer, first_peer);

        let mut third = Vec::new();
        download.pick_blocks_endgame(5, &mut third, &second_peer);
        assert!(third.is_empty());
    }
}
