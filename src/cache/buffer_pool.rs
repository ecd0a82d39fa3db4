use crate::constants::{POOL_ALIGN, POOL_MAX_BUFFER, POOL_SLAB_CAP};
use bytes::BytesMut;
use std::collections::HashMap;

/// Size-classed free lists for large transient buffers.
///
/// Requested sizes round up to an 8-byte aligned bucket; each bucket
/// keeps a capped slab of free buffers. Requests over 256 KiB bypass the
/// pool entirely. The pool lives on the reactor and is not shared across
/// threads.
///
/// Invariant: a buffer comes back with the exact capacity of the bucket
/// it was allocated from. Growing a pooled buffer and returning it would
/// corrupt the size classes, so that is a debug assertion.
pub struct BufferPool {
    classes: HashMap<usize, Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    fn bucket_for(size: usize) -> usize {
        size.div_ceil(POOL_ALIGN) * POOL_ALIGN
    }

    /// Hands out a cleared buffer with at least `size` bytes of capacity.
    pub fn acquire(&mut self, size: usize) -> BytesMut {
        if size > POOL_MAX_BUFFER {
            return BytesMut::with_capacity(size);
        }
        let bucket = Self::bucket_for(size);
        self.classes
            .get_mut(&bucket)
            .and_then(Vec::pop)
            .unwrap_or_else(|| BytesMut::with_capacity(bucket))
    }

    /// Returns a buffer to its bucket's free list.
    pub fn release(&mut self, mut buf: BytesMut) {
        let cap = buf.capacity();
        if cap > POOL_MAX_BUFFER {
            return;
        }
        debug_assert_eq!(cap % POOL_ALIGN, 0, "returned buffer is not a pool bucket");
        buf.clear();
        let slab = self.classes.entry(cap).or_default();
        if slab.len() < POOL_SLAB_CAP {
            slab.push(buf);
        }
    }

    /// Number of free buffers currently held for `size`'s bucket.
    pub fn free_count(&self, size: usize) -> usize {
        self.classes
            .get(&Self::bucket_for(size))
            .map_or(0, Vec::len)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
