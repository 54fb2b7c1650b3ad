//! Scatter-gather descriptions of discontiguous memory.
//!
//! An imported plane may describe its payload as an ordered list of segments
//! inside the memory of its handle. [`SgChunks`] walks such a plane as a
//! sequence of contiguous byte slices, which is also how a plain linear plane
//! is read, so consumers only deal with one kind of source.

/// One contiguous segment of a scatter-gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Offset of the segment from the start of the handle's memory.
    pub offset: usize,
    pub len: usize,
}

impl SgEntry {
    pub fn new(offset: usize, len: usize) -> Self {
        SgEntry { offset, len }
    }
}

/// Ordered list of segments making up a plane.
///
/// # Examples
///
/// ```
/// # use privcam::memory::{SgEntry, SgTable};
/// let table: SgTable = [SgEntry::new(4096, 100), SgEntry::new(0, 28)]
///     .into_iter()
///     .collect();
/// assert_eq!(table.total_len(), 128);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable(Vec<SgEntry>);

impl SgTable {
    pub fn new(entries: Vec<SgEntry>) -> Self {
        SgTable(entries)
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.0
    }

    /// Number of payload bytes described by the table.
    pub fn total_len(&self) -> usize {
        self.0.iter().map(|e| e.len).sum()
    }
}

impl FromIterator<SgEntry> for SgTable {
    fn from_iter<I: IntoIterator<Item = SgEntry>>(iter: I) -> Self {
        SgTable(iter.into_iter().collect())
    }
}

enum ChunkLayout<'a> {
    Linear,
    Segments(std::slice::Iter<'a, SgEntry>),
}

/// Iterator over the contiguous chunks of a plane.
///
/// Segments are clamped to the memory actually mapped: a segment that runs
/// past the end of the mapping yields what is there and ends the iteration,
/// and a segment starting beyond it ends the iteration without yielding.
pub struct SgChunks<'a> {
    data: &'a [u8],
    layout: ChunkLayout<'a>,
    done: bool,
}

impl<'a> SgChunks<'a> {
    /// Reads `data` as a single contiguous chunk.
    pub fn linear(data: &'a [u8]) -> Self {
        SgChunks {
            data,
            layout: ChunkLayout::Linear,
            done: false,
        }
    }

    /// Reads the segments of `table` from `data`, in order.
    pub fn segments(data: &'a [u8], table: &'a SgTable) -> Self {
        SgChunks {
            data,
            layout: ChunkLayout::Segments(table.entries().iter()),
            done: false,
        }
    }
}

impl<'a> Iterator for SgChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let data = self.data;
        match &mut self.layout {
            ChunkLayout::Linear => {
                self.done = true;
                Some(data)
            }
            ChunkLayout::Segments(entries) => loop {
                let Some(entry) = entries.next() else {
                    self.done = true;
                    return None;
                };
                if entry.len == 0 {
                    continue;
                }
                if entry.offset >= data.len() {
                    self.done = true;
                    return None;
                }

                let end = entry.offset.saturating_add(entry.len);
                let clamped_end = end.min(data.len());
                if clamped_end < end {
                    self.done = true;
                }
                return Some(&data[entry.offset..clamped_end]);
            },
        }
    }
}
