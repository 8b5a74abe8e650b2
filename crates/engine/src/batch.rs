//! Request batching
//!
//! The backing store's native atomic call covers a bounded number of
//! items. Larger op sets are split here into ordered chunks, each chunk
//! becoming one request inside the same logical transaction, so the full
//! set still commits or rolls back as a unit.

/// Split `ops` into ordered chunks of at most `max` elements.
///
/// Order is preserved within and across chunks. A `max` of zero is
/// treated as one to keep the split total.
pub fn chunk_ops<T>(ops: Vec<T>, max: usize) -> Vec<Vec<T>> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(ops.len().div_ceil(max));
    let mut current = Vec::with_capacity(max.min(ops.len()));
    for op in ops {
        if current.len() == max {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(max)));
        }
        current.push(op);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
