/// Contiguous slice of a job's input, dispatched as one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk<I> {
    /// Position in the chunk plan
    pub(crate) index: usize,
    /// Original index of the first item
    pub(crate) offset: usize,
    pub(crate) items: Vec<I>,
}

impl<I> Chunk<I> {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Original indices covered by this chunk.
    pub(crate) fn positions(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.items.len()
    }
}

/// Splits `items` into `ceil(len / chunk_size)` ordered chunks; only the last
/// may be short.
///
/// `chunk_size` must be non-zero.
pub(crate) fn partition<I>(items: Vec<I>, chunk_size: usize) -> Vec<Chunk<I>> {
    debug_assert!(chunk_size > 0);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut items = items.into_iter().peekable();
    let mut offset = 0;

    while items.peek().is_some() {
        let batch: Vec<I> = items.by_ref().take(chunk_size).collect();
        let len = batch.len();
        chunks.push(Chunk {
            index: chunks.len(),
            offset,
            items: batch,
        });
        offset += len;
    }

    chunks
}
