//! Block references and the ordered request lists the scheduler moves
//! them between.

/// A reference to one sub-piece block on the wire.
///
/// `length` is conventionally at most 16 KiB; `begin` is not required to
/// be block-aligned because some peers request irregular offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    /// The piece index.
    pub piece: u32,
    /// Byte offset within the piece.
    pub begin: u32,
    /// Length of the block in bytes.
    pub length: u32,
}

impl BlockRef {
    pub fn new(piece: u32, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }
}

/// Stable handle to one entry in a [`RequestList`].
///
/// Handles stay valid across unrelated insertions and removals, which
/// lets timers refer back to the entry they were armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// An ordered, duplicate-tolerant sequence of block references.
///
/// Entries keep arrival order; every operation is O(n), which is fine at
/// pipeline depth.
#[derive(Debug, Default)]
pub struct RequestList {
    entries: Vec<(RequestId, BlockRef)>,
    next_id: u64,
}

impl RequestList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block and returns its stable handle.
    pub fn push(&mut self, block: BlockRef) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, block));
        id
    }

    /// Removes the entry with the given handle.
    pub fn remove(&mut self, id: RequestId) -> Option<BlockRef> {
        let pos = self.entries.iter().position(|(eid, _)| *eid == id)?;
        Some(self.entries.remove(pos).1)
    }

    /// Removes the first entry matching the block reference.
    pub fn remove_block(&mut self, block: &BlockRef) -> Option<RequestId> {
        let pos = self.entries.iter().position(|(_, b)| b == block)?;
        Some(self.entries.remove(pos).0)
    }

    /// Removes and returns every entry for the given piece.
    pub fn remove_piece(&mut self, piece: u32) -> Vec<(RequestId, BlockRef)> {
        let mut removed = Vec::new();
        self.entries.retain(|(id, b)| {
            if b.piece == piece {
                removed.push((*id, *b));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Removes and returns the oldest entry.
    pub fn pop_front(&mut self) -> Option<(RequestId, BlockRef)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Looks up the first entry matching a piece/offset pair.
    pub fn find_block(&self, piece: u32, begin: u32) -> Option<(RequestId, BlockRef)> {
        self.entries
            .iter()
            .find(|(_, b)| b.piece == piece && b.begin == begin)
            .copied()
    }

    pub fn contains_block(&self, block: &BlockRef) -> bool {
        self.entries.iter().any(|(_, b)| b == block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries and returns them in order.
    pub fn drain(&mut self) -> Vec<(RequestId, BlockRef)> {
        std::mem::take(&mut self.entries)
    }

    /// Moves every entry into `other`, keeping order, and returns each
    /// block with the fresh handle it got in the destination list.
    pub fn splice_into(&mut self, other: &mut RequestList) -> Vec<(RequestId, BlockRef)> {
        self.drain()
            .into_iter()
            .map(|(_, block)| (other.push(block), block))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
