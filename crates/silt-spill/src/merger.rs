//! K-way merge over sorted record cursors.

use silt_common::{PrefixComparator, RecordComparator, RecordCursor, Result, SortError};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Builds a merged cursor from any number of sorted sources.
///
/// Sources are typically spill-run readers plus at most one in-memory
/// cursor; each source must already be sorted under the same comparators.
pub struct RunMerger {
    record_cmp: Arc<dyn RecordComparator>,
    prefix_cmp: Arc<dyn PrefixComparator>,
    heap: BinaryHeap<HeapEntry>,
    num_records: usize,
}

impl RunMerger {
    /// Creates a merger; `capacity_hint` sizes the internal heap.
    pub fn new(
        record_cmp: Arc<dyn RecordComparator>,
        prefix_cmp: Arc<dyn PrefixComparator>,
        capacity_hint: usize,
    ) -> Self {
        Self {
            record_cmp,
            prefix_cmp,
            heap: BinaryHeap::with_capacity(capacity_hint),
            num_records: 0,
        }
    }

    /// Adds a source unless it is empty.
    ///
    /// The source's first record is loaded here so the heap can order it.
    pub fn add_if_not_empty(&mut self, mut cursor: Box<dyn RecordCursor>) -> Result<()> {
        if !cursor.has_next() {
            return Ok(());
        }
        self.num_records += cursor.num_records();
        cursor.load_next()?;
        self.heap.push(HeapEntry {
            cursor,
            record_cmp: Arc::clone(&self.record_cmp),
            prefix_cmp: Arc::clone(&self.prefix_cmp),
        });
        Ok(())
    }

    /// Consumes the merger, returning the merged output cursor.
    pub fn into_sorted_cursor(self) -> MergedCursor {
        let remaining = self.num_records;
        MergedCursor {
            heap: self.heap,
            current: None,
            num_records: self.num_records,
            remaining,
        }
    }
}

/// Globally sorted stream over the merger's sources.
pub struct MergedCursor {
    heap: BinaryHeap<HeapEntry>,
    current: Option<HeapEntry>,
    num_records: usize,
    remaining: usize,
}

impl RecordCursor for MergedCursor {
    fn num_records(&self) -> usize {
        self.num_records
    }

    fn has_next(&self) -> bool {
        self.remaining > 0
    }

    fn load_next(&mut self) -> Result<()> {
        if let Some(mut entry) = self.current.take() {
            if entry.cursor.has_next() {
                entry.cursor.load_next()?;
                self.heap.push(entry);
            }
        }
        self.current = Some(self.heap.pop().ok_or_else(|| {
            SortError::Internal("merge cursor advanced past its last record".to_string())
        })?);
        self.remaining -= 1;
        Ok(())
    }

    fn record(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|e| e.cursor.record())
            .unwrap_or(&[])
    }

    fn prefix(&self) -> u64 {
        self.current.as_ref().map(|e| e.cursor.prefix()).unwrap_or(0)
    }
}

/// Heap wrapper ordering sources by their current record.
struct HeapEntry {
    cursor: Box<dyn RecordCursor>,
    record_cmp: Arc<dyn RecordComparator>,
    prefix_cmp: Arc<dyn PrefixComparator>,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the smallest record first.
        self.prefix_cmp
            .compare(self.cursor.prefix(), other.cursor.prefix())
            .then_with(|| {
                self.record_cmp
                    .compare(self.cursor.record(), other.cursor.record())
            })
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}
