//! Pointer-array index over in-memory records.
//!
//! Each inserted record contributes two words to the backing array: its
//! encoded address and its sort prefix. Sorting orders the pointer pairs,
//! not the record bytes; ties on the prefix fall back to the full record
//! comparator, resolving addresses through the sorter's sealed pages.

use bytes::Bytes;
use silt_common::{
    PrefixComparator, RecordAddress, RecordComparator, RecordCursor, Result, SealedPage,
    SortError,
};
use silt_memory::{LongArray, TaskMemoryManager};
use std::collections::HashMap;
use std::sync::Arc;

/// Map from page number to sealed page, shared with sorted cursors.
pub type PageMap = HashMap<u32, SealedPage>;

/// Resolves a record address against a page map.
fn resolve(pages: &PageMap, address: RecordAddress) -> Option<Bytes> {
    pages
        .get(&address.page())
        .map(|page| page.record_at(address.offset()))
}

/// In-memory index of `(address, prefix)` pairs.
///
/// The backing array is allocated and freed through the task memory
/// manager; growth happens by copy into a replacement array supplied by
/// the owning sorter.
pub struct PointerArraySorter {
    array: LongArray,
    /// Words in use; two per record.
    pos: usize,
    mem: Arc<TaskMemoryManager>,
}

impl PointerArraySorter {
    /// Creates an index over the given backing array.
    pub fn new(array: LongArray, mem: Arc<TaskMemoryManager>) -> Self {
        Self {
            array,
            pos: 0,
            mem,
        }
    }

    /// Returns the number of indexed records.
    pub fn num_records(&self) -> usize {
        self.pos / 2
    }

    /// Returns the bytes held by the backing array.
    pub fn memory_usage(&self) -> u64 {
        self.array.byte_size() as u64
    }

    /// Returns true if one more record fits without growing.
    pub fn has_space_for_another_record(&self) -> bool {
        self.pos + 2 <= self.array.words()
    }

    /// Registers a record.
    pub fn insert_record(&mut self, address: RecordAddress, prefix: u64) {
        debug_assert!(self.has_space_for_another_record());
        self.array.set(self.pos, address.as_u64());
        self.array.set(self.pos + 1, prefix);
        self.pos += 2;
    }

    /// Replaces the backing array with a larger one, copying live entries.
    ///
    /// The old array is released back to the memory manager.
    pub fn expand_pointer_array(&mut self, mut new_array: LongArray) {
        debug_assert!(new_array.words() >= self.pos);
        new_array.copy_from(&self.array, self.pos);
        let old = std::mem::replace(&mut self.array, new_array);
        self.mem.free_array(old);
    }

    /// Empties the index for reuse, keeping the backing array.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Releases the backing array to the memory manager.
    pub fn free(self) {
        self.mem.free_array(self.array);
    }

    /// Sorts the live entries and returns a cursor over the result.
    ///
    /// The cursor owns an immutable snapshot plus the page map, so it stays
    /// valid across a later `reset()` of this index but holds no reference
    /// to the index itself.
    pub fn sorted_cursor(
        &self,
        pages: Arc<PageMap>,
        record_cmp: &dyn RecordComparator,
        prefix_cmp: &dyn PrefixComparator,
    ) -> SortedCursor {
        let mut entries: Vec<SortEntry> = (0..self.num_records())
            .map(|i| SortEntry {
                address: RecordAddress::from_u64(self.array.get(2 * i)),
                prefix: self.array.get(2 * i + 1),
            })
            .collect();

        entries.sort_by(|a, b| {
            prefix_cmp.compare(a.prefix, b.prefix).then_with(|| {
                match (resolve(&pages, a.address), resolve(&pages, b.address)) {
                    (Some(ra), Some(rb)) => record_cmp.compare(&ra, &rb),
                    // Unresolvable addresses cannot be ordered further.
                    _ => std::cmp::Ordering::Equal,
                }
            })
        });

        SortedCursor {
            entries: entries.into(),
            pages,
            pos: 0,
            current: None,
        }
    }
}

/// One sorted index entry.
#[derive(Debug, Clone, Copy)]
struct SortEntry {
    address: RecordAddress,
    prefix: u64,
}

/// Cursor over a sorted snapshot of the index.
///
/// Cloning yields an independent cursor at the current position.
#[derive(Clone)]
pub struct SortedCursor {
    entries: Arc<[SortEntry]>,
    pages: Arc<PageMap>,
    pos: usize,
    current: Option<(Bytes, u64, u32)>,
}

impl SortedCursor {
    /// Returns the page number backing the current record.
    pub fn current_page(&self) -> Option<u32> {
        self.current.as_ref().map(|(_, _, page)| *page)
    }

    /// Returns a cheap handle to the current record and its prefix.
    pub fn current_handle(&self) -> (Bytes, u64) {
        self.current
            .as_ref()
            .map(|(record, prefix, _)| (record.clone(), *prefix))
            .unwrap_or((Bytes::new(), 0))
    }
}

impl RecordCursor for SortedCursor {
    fn num_records(&self) -> usize {
        self.entries.len()
    }

    fn has_next(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn load_next(&mut self) -> Result<()> {
        let entry = self.entries[self.pos];
        let record = resolve(&self.pages, entry.address).ok_or_else(|| {
            SortError::Internal(format!(
                "record address {} points outside the live page set",
                entry.address
            ))
        })?;
        self.current = Some((record, entry.prefix, entry.address.page()));
        self.pos += 1;
        Ok(())
    }

    fn record(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|(record, _, _)| record.as_ref())
            .unwrap_or(&[])
    }

    fn prefix(&self) -> u64 {
        self.current.as_ref().map(|(_, prefix, _)| *prefix).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_common::{BytewiseComparator, MemoryConfig, UnsignedPrefixComparator, WritePage};

    fn create_test_mem() -> Arc<TaskMemoryManager> {
        TaskMemoryManager::new(MemoryConfig {
            budget_bytes: 1024 * 1024,
        })
    }

    fn create_test_index(
        mem: &Arc<TaskMemoryManager>,
        capacity: usize,
    ) -> PointerArraySorter {
        let id = mem.next_consumer_id();
        let array = mem.allocate_array(capacity * 2, id).unwrap();
        PointerArraySorter::new(array, Arc::clone(mem))
    }

    /// Builds one sealed page holding the given records and an index over
    /// them, inserted in the given order with the given prefixes.
    fn build_page(records: &[(&[u8], u64)]) -> (Arc<PageMap>, Vec<(RecordAddress, u64)>) {
        let mut page = WritePage::new(0, 4096);
        let mut addresses = Vec::new();
        for (payload, prefix) in records {
            let offset = page.append_record(payload);
            addresses.push((RecordAddress::new(0, offset), *prefix));
        }
        let sealed = page.seal();
        let mut map = PageMap::new();
        map.insert(0, sealed);
        (Arc::new(map), addresses)
    }

    #[test]
    fn test_insert_and_capacity() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 2);

        assert_eq!(index.num_records(), 0);
        assert!(index.has_space_for_another_record());

        index.insert_record(RecordAddress::new(0, 0), 5);
        index.insert_record(RecordAddress::new(0, 10), 3);
        assert_eq!(index.num_records(), 2);
        assert!(!index.has_space_for_another_record());

        index.free();
        assert_eq!(mem.used_bytes(), 0);
    }

    #[test]
    fn test_expand_preserves_entries() {
        let mem = create_test_mem();
        let id = mem.next_consumer_id();
        let mut index = create_test_index(&mem, 1);

        index.insert_record(RecordAddress::new(0, 0), 42);
        assert!(!index.has_space_for_another_record());

        let bigger = mem.allocate_array(8, id).unwrap();
        index.expand_pointer_array(bigger);
        assert!(index.has_space_for_another_record());
        assert_eq!(index.num_records(), 1);
        // Old array was returned to the manager; only the new one is live.
        assert_eq!(mem.used_bytes(), 64);

        index.free();
        assert_eq!(mem.used_bytes(), 0);
    }

    #[test]
    fn test_sorted_cursor_orders_by_prefix() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 8);
        let (pages, addresses) =
            build_page(&[(b"c", 3), (b"a", 1), (b"d", 4), (b"b", 1)]);
        for (address, prefix) in &addresses {
            index.insert_record(*address, *prefix);
        }

        let mut cursor =
            index.sorted_cursor(pages, &BytewiseComparator, &UnsignedPrefixComparator);
        assert_eq!(cursor.num_records(), 4);

        let mut seen = Vec::new();
        while cursor.has_next() {
            cursor.load_next().unwrap();
            seen.push((cursor.record().to_vec(), cursor.prefix()));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 3),
                (b"d".to_vec(), 4),
            ]
        );

        index.free();
    }

    #[test]
    fn test_sorted_cursor_ties_break_on_record_bytes() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 8);
        let (pages, addresses) = build_page(&[(b"zz", 7), (b"aa", 7), (b"mm", 7)]);
        for (address, prefix) in &addresses {
            index.insert_record(*address, *prefix);
        }

        let mut cursor =
            index.sorted_cursor(pages, &BytewiseComparator, &UnsignedPrefixComparator);
        let mut seen = Vec::new();
        while cursor.has_next() {
            cursor.load_next().unwrap();
            seen.push(cursor.record().to_vec());
        }
        assert_eq!(seen, vec![b"aa".to_vec(), b"mm".to_vec(), b"zz".to_vec()]);

        index.free();
    }

    #[test]
    fn test_cursor_survives_reset() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 4);
        let (pages, addresses) = build_page(&[(b"x", 2), (b"y", 1)]);
        for (address, prefix) in &addresses {
            index.insert_record(*address, *prefix);
        }

        let mut cursor =
            index.sorted_cursor(pages, &BytewiseComparator, &UnsignedPrefixComparator);
        index.reset();
        assert_eq!(index.num_records(), 0);

        cursor.load_next().unwrap();
        assert_eq!(cursor.prefix(), 1);
        cursor.load_next().unwrap();
        assert_eq!(cursor.prefix(), 2);

        index.free();
    }

    #[test]
    fn test_cursor_clone_is_independent() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 4);
        let (pages, addresses) = build_page(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        for (address, prefix) in &addresses {
            index.insert_record(*address, *prefix);
        }

        let mut cursor =
            index.sorted_cursor(pages, &BytewiseComparator, &UnsignedPrefixComparator);
        cursor.load_next().unwrap();
        assert_eq!(cursor.prefix(), 1);

        // Clone picks up at the same position; advancing it does not move
        // the original.
        let mut clone = cursor.clone();
        clone.load_next().unwrap();
        assert_eq!(clone.prefix(), 2);
        clone.load_next().unwrap();
        assert_eq!(clone.prefix(), 3);
        assert!(!clone.has_next());

        cursor.load_next().unwrap();
        assert_eq!(cursor.prefix(), 2);

        index.free();
    }

    #[test]
    fn test_current_page_tracking() {
        let mem = create_test_mem();
        let mut index = create_test_index(&mem, 4);
        let (pages, addresses) = build_page(&[(b"only", 9)]);
        index.insert_record(addresses[0].0, addresses[0].1);

        let mut cursor =
            index.sorted_cursor(pages, &BytewiseComparator, &UnsignedPrefixComparator);
        assert_eq!(cursor.current_page(), None);
        cursor.load_next().unwrap();
        assert_eq!(cursor.current_page(), Some(0));

        index.free();
    }
}
