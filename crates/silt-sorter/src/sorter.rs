//! External sorter.
//!
//! Records are appended to memory pages and indexed by `(address, prefix)`
//! pairs. Under memory pressure the index is drained to a sorted spill run
//! on disk and the pages are released; output re-establishes the global
//! order by merging runs with the in-memory tail. The sorter is registered
//! with the task memory manager as a spill participant and with the task
//! context for guaranteed cleanup.
//!
//! Lock order, everywhere: iterator monitor, then sorter monitor, then the
//! memory manager. The insertion path never holds the sorter monitor
//! across a manager allocation, so a self-spill triggered by that
//! allocation can take the monitor itself.

use crate::chain::ChainedCursor;
use crate::index::{PageMap, PointerArraySorter, SortedCursor};
use crate::spillable::{SpillableCursor, SpillableShared, Upstream};
use parking_lot::Mutex;
use silt_common::{
    PrefixComparator, RecordAddress, RecordComparator, RecordCursor, Result, SealedPage,
    SortError, SorterConfig, WritePage,
};
use silt_memory::{ConsumerId, MemoryConsumer, TaskContext, TaskMemoryManager};
use silt_spill::{RunMerger, SpillWriter, SpilledRun};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// External sorter for variable-length binary records with u64 prefixes.
pub struct ExternalSorter {
    id: ConsumerId,
    mem: Arc<TaskMemoryManager>,
    record_cmp: Arc<dyn RecordComparator>,
    prefix_cmp: Arc<dyn PrefixComparator>,
    config: SorterConfig,
    /// Sequence for spill run file names.
    run_seq: AtomicU64,
    /// High-water mark of pages + index bytes; never decreases.
    peak_memory_used: AtomicU64,
    /// Sorter monitor: pages, index, run registry.
    inner: Mutex<SorterInner>,
    /// Active reading iterator, if a sorted iterator has been handed out.
    /// Foreign spill triggers are delegated to it.
    reading: Mutex<Option<Arc<SpillableShared>>>,
}

struct SorterInner {
    /// Sealed pages holding indexed records.
    pages: Vec<SealedPage>,
    /// Page currently accepting writes.
    current: Option<WritePage>,
    /// In-memory index; `None` between an index-freeing spill and the next
    /// insert.
    index: Option<PointerArraySorter>,
    /// Spill runs in creation order.
    runs: Vec<SpilledRun>,
    /// Set once an output iterator has been handed out.
    iterator_consumed: bool,
    /// Set by `cleanup_resources`.
    closed: bool,
}

/// What the insertion path needs to do about the index before inserting.
enum IndexNeed {
    Ready,
    Create,
    Grow(usize),
}

impl ExternalSorter {
    /// Creates a sorter with a fresh in-memory index.
    pub fn create(
        mem: Arc<TaskMemoryManager>,
        ctx: &TaskContext,
        record_cmp: Arc<dyn RecordComparator>,
        prefix_cmp: Arc<dyn PrefixComparator>,
        config: SorterConfig,
    ) -> Result<Arc<Self>> {
        let id = mem.next_consumer_id();
        let array = mem.allocate_array(config.initial_index_capacity * 2, id)?;
        let index = PointerArraySorter::new(array, Arc::clone(&mem));
        Self::build(mem, ctx, record_cmp, prefix_cmp, config, id, Some(index), Vec::new())
    }

    /// Creates a sorter from an already-populated index and its pages.
    ///
    /// The index is drained to a spill run immediately; the sorter then
    /// operates index-less until the first insert re-creates one.
    pub fn create_with_existing_index(
        mem: Arc<TaskMemoryManager>,
        ctx: &TaskContext,
        record_cmp: Arc<dyn RecordComparator>,
        prefix_cmp: Arc<dyn PrefixComparator>,
        config: SorterConfig,
        index: PointerArraySorter,
        pages: Vec<SealedPage>,
    ) -> Result<Arc<Self>> {
        let id = mem.next_consumer_id();
        let sorter = Self::build(
            mem,
            ctx,
            record_cmp,
            prefix_cmp,
            config,
            id,
            Some(index),
            pages,
        )?;
        sorter.spill(u64::MAX, id)?;
        // The drain resets the index but keeps its array; the sorter is
        // meant to run index-less until the first insert, so drop it now.
        if let Some(index) = sorter.inner.lock().index.take() {
            index.free();
        }
        Ok(sorter)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        mem: Arc<TaskMemoryManager>,
        ctx: &TaskContext,
        record_cmp: Arc<dyn RecordComparator>,
        prefix_cmp: Arc<dyn PrefixComparator>,
        config: SorterConfig,
        id: ConsumerId,
        index: Option<PointerArraySorter>,
        pages: Vec<SealedPage>,
    ) -> Result<Arc<Self>> {
        let sorter = Arc::new(Self {
            id,
            mem,
            record_cmp,
            prefix_cmp,
            config,
            run_seq: AtomicU64::new(0),
            peak_memory_used: AtomicU64::new(0),
            inner: Mutex::new(SorterInner {
                pages,
                current: None,
                index,
                runs: Vec::new(),
                iterator_consumed: false,
                closed: false,
            }),
            reading: Mutex::new(None),
        });

        sorter
            .mem
            .register_consumer(id, Arc::downgrade(&(Arc::clone(&sorter) as Arc<dyn MemoryConsumer>)));
        {
            let cleanup = Arc::clone(&sorter);
            ctx.on_completion(move || cleanup.cleanup_resources());
        }
        {
            let inner = sorter.inner.lock();
            sorter.update_peak(&inner);
        }
        Ok(sorter)
    }

    /// Returns this sorter's memory-consumer identity.
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Writes a record to the sorter.
    pub fn insert(&self, record: &[u8], prefix: u64) -> Result<()> {
        let required = record.len() + 4;
        if required > self.config.page_size {
            return Err(SortError::RecordTooLarge {
                size: record.len(),
                max: self.config.page_size,
            });
        }
        self.grow_pointer_array_if_necessary()?;

        loop {
            {
                let mut inner = self.inner.lock();
                self.check_writable(&inner)?;
                if let Some(page) = inner.current.as_mut() {
                    if page.has_space(required) {
                        let offset = page.append_record(record);
                        let address = RecordAddress::new(page.number(), offset);
                        return Self::index_insert(&mut inner, address, prefix);
                    }
                }
            }
            self.acquire_new_page()?;
        }
    }

    /// Writes a key/value record to the sorter.
    ///
    /// The key and value are stored together as
    /// `[total][key_len][key][value]`, so comparators and spill runs see
    /// one contiguous record.
    pub fn insert_key_value(&self, key: &[u8], value: &[u8], prefix: u64) -> Result<()> {
        let required = key.len() + value.len() + 8;
        if required > self.config.page_size {
            return Err(SortError::RecordTooLarge {
                size: key.len() + value.len() + 4,
                max: self.config.page_size,
            });
        }
        self.grow_pointer_array_if_necessary()?;

        loop {
            {
                let mut inner = self.inner.lock();
                self.check_writable(&inner)?;
                if let Some(page) = inner.current.as_mut() {
                    if page.has_space(required) {
                        let offset = page.append_key_value(key, value);
                        let address = RecordAddress::new(page.number(), offset);
                        return Self::index_insert(&mut inner, address, prefix);
                    }
                }
            }
            self.acquire_new_page()?;
        }
    }

    /// Merges another sorter into this one; `other` is left empty and
    /// cleaned up.
    pub fn merge(&self, other: &ExternalSorter) -> Result<()> {
        other.spill(u64::MAX, other.id)?;
        let moved: Vec<SpilledRun> = other.inner.lock().runs.drain(..).collect();
        self.inner.lock().runs.extend(moved);
        other.cleanup_resources();
        Ok(())
    }

    /// Returns the globally sorted output stream.
    ///
    /// At most one output iterator may be consumed per sorter. The caller
    /// remains responsible for `cleanup_resources` afterwards; the task
    /// completion hook covers partially consumed output.
    pub fn sorted_iterator(&self) -> Result<Box<dyn RecordCursor>> {
        let mut inner = self.inner.lock();
        self.take_iterator_slot(&mut inner)?;

        if inner.runs.is_empty() {
            let cursor = match self.in_memory_cursor(&inner) {
                Some(cursor) => cursor,
                // Nothing was ever inserted.
                None => return Ok(Box::new(ChainedCursor::new(Vec::new()))),
            };
            drop(inner);
            let remaining = cursor.num_records();
            let shared = SpillableShared::new(cursor, Arc::clone(&self.mem));
            *self.reading.lock() = Some(Arc::clone(&shared));
            return Ok(Box::new(SpillableCursor::new(shared, remaining)));
        }

        let mut merger = RunMerger::new(
            Arc::clone(&self.record_cmp),
            Arc::clone(&self.prefix_cmp),
            inner.runs.len() + 1,
        );
        for run in &inner.runs {
            merger.add_if_not_empty(Box::new(run.open_reader()?))?;
        }
        let in_memory = self.in_memory_cursor(&inner);
        drop(inner);
        if let Some(cursor) = in_memory {
            let remaining = cursor.num_records();
            let shared = SpillableShared::new(cursor, Arc::clone(&self.mem));
            *self.reading.lock() = Some(Arc::clone(&shared));
            merger.add_if_not_empty(Box::new(SpillableCursor::new(shared, remaining)))?;
        }
        Ok(Box::new(merger.into_sorted_cursor()))
    }

    /// Returns the records in insertion order across the spill and
    /// in-memory segments: runs in registry order, then the in-memory tail.
    /// No spill-during-iteration support on this path.
    pub fn insertion_order_iterator(&self) -> Result<Box<dyn RecordCursor>> {
        let mut inner = self.inner.lock();
        self.take_iterator_slot(&mut inner)?;

        let mut sources: Vec<Box<dyn RecordCursor>> = Vec::new();
        for run in &inner.runs {
            sources.push(Box::new(run.open_reader()?));
        }
        if let Some(cursor) = self.in_memory_cursor(&inner) {
            sources.push(Box::new(cursor));
        }
        Ok(Box::new(ChainedCursor::new(sources)))
    }

    /// Frees this sorter's in-memory structures and deletes its spill
    /// files. Idempotent; registered with the task context so it runs on
    /// every exit path.
    pub fn cleanup_resources(&self) {
        // The reading iterator may be pinning a page between a
        // mid-iteration spill and its next load; its monitor must be taken
        // before the sorter monitor.
        if let Some(shared) = self.reading.lock().take() {
            shared.release_resources();
        }

        let mut inner = self.inner.lock();
        for run in inner.runs.drain(..) {
            if let Err(e) = run.remove_file() {
                error!(
                    path = %run.path().display(),
                    error = %e,
                    "failed to delete spill file during cleanup"
                );
            }
        }
        self.free_all_pages(&mut inner);
        if let Some(index) = inner.index.take() {
            index.free();
        }
        inner.closed = true;
        drop(inner);

        self.mem.unregister_consumer(self.id);
    }

    /// Returns the peak memory used so far, in bytes.
    pub fn peak_memory_used_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        self.update_peak(&inner);
        self.peak_memory_used.load(Ordering::Acquire)
    }

    /// Returns the number of pages currently held (diagnostic).
    pub fn number_of_allocated_pages(&self) -> usize {
        let inner = self.inner.lock();
        inner.pages.len() + inner.current.is_some() as usize
    }

    /// Forces the next insert onto a fresh page (test hook).
    pub fn close_current_page(&self) {
        if let Some(page) = self.inner.lock().current.as_mut() {
            page.close();
        }
    }

    // ---- insertion internals ----

    fn check_writable(&self, inner: &SorterInner) -> Result<()> {
        if inner.closed {
            return Err(SortError::SorterClosed);
        }
        if inner.iterator_consumed {
            return Err(SortError::IteratorConsumed);
        }
        Ok(())
    }

    fn index_insert(
        inner: &mut SorterInner,
        address: RecordAddress,
        prefix: u64,
    ) -> Result<()> {
        match inner.index.as_mut() {
            Some(index) if index.has_space_for_another_record() => {
                index.insert_record(address, prefix);
                Ok(())
            }
            _ => Err(SortError::Internal(
                "index unavailable at insertion time".to_string(),
            )),
        }
    }

    /// Seals the full current page and installs a freshly allocated one.
    ///
    /// The allocation happens without the sorter monitor held, because the
    /// memory manager may call back into `spill` on this thread.
    fn acquire_new_page(&self) -> Result<()> {
        let page = self.mem.allocate_page(self.config.page_size, self.id)?;
        let mut inner = self.inner.lock();
        if let Some(full) = inner.current.take() {
            inner.pages.push(full.seal());
        }
        inner.current = Some(page);
        self.update_peak(&inner);
        Ok(())
    }

    /// Ensures the index exists and can take one more record, growing the
    /// backing array through the memory manager if needed.
    ///
    /// The array allocation itself may trigger a spill of this sorter. An
    /// allocation failure is swallowed exactly when such a spill already
    /// emptied the index; a successful allocation is released unused when
    /// the spill made growth unnecessary.
    fn grow_pointer_array_if_necessary(&self) -> Result<()> {
        let need = {
            let inner = self.inner.lock();
            match inner.index.as_ref() {
                None => IndexNeed::Create,
                Some(index) if !index.has_space_for_another_record() => {
                    IndexNeed::Grow(index.memory_usage() as usize / 8)
                }
                Some(_) => IndexNeed::Ready,
            }
        };

        match need {
            IndexNeed::Ready => Ok(()),
            IndexNeed::Create => {
                let words = self.config.initial_index_capacity * 2;
                let array = self.mem.allocate_array(words, self.id)?;
                let mut inner = self.inner.lock();
                if inner.index.is_none() {
                    inner.index =
                        Some(PointerArraySorter::new(array, Arc::clone(&self.mem)));
                    self.update_peak(&inner);
                } else {
                    self.mem.free_array(array);
                }
                Ok(())
            }
            IndexNeed::Grow(words) => match self.mem.allocate_array(words * 2, self.id) {
                Ok(array) => {
                    let mut inner = self.inner.lock();
                    match inner.index.as_mut() {
                        Some(index) if !index.has_space_for_another_record() => {
                            index.expand_pointer_array(array);
                        }
                        // A spill during the allocation already made space.
                        _ => self.mem.free_array(array),
                    }
                    self.update_peak(&inner);
                    Ok(())
                }
                Err(e @ SortError::MemoryUnavailable { .. }) => {
                    let inner = self.inner.lock();
                    match inner.index.as_ref() {
                        Some(index) if index.has_space_for_another_record() => Ok(()),
                        _ => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    // ---- spill internals ----

    /// Drains the in-memory index to a new spill run and frees all pages.
    fn spill_in_memory(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(mut index) = inner.index.take() else {
            return Ok(0);
        };
        if index.num_records() == 0 {
            inner.index = Some(index);
            return Ok(0);
        }

        debug!(
            consumer = self.id.0,
            records = index.num_records(),
            runs_so_far = inner.runs.len(),
            "spilling sort data to disk"
        );

        // Entries may point into the partially written current page; seal
        // it so they resolve.
        if let Some(current) = inner.current.take() {
            inner.pages.push(current.seal());
        }

        let result = self.write_run(
            &index.sorted_cursor(
                Arc::new(Self::page_map(&inner.pages)),
                &*self.record_cmp,
                &*self.prefix_cmp,
            ),
            index.num_records(),
        );
        match result {
            Ok(run) => {
                inner.runs.push(run);
                index.reset();
                inner.index = Some(index);
                Ok(self.free_all_pages(&mut inner))
            }
            Err(e) => {
                inner.index = Some(index);
                Err(e)
            }
        }
    }

    /// Spills the unread tail of the active reading iterator.
    ///
    /// Takes the iterator monitor first and the sorter monitor second,
    /// matching the one permitted nesting order.
    pub(crate) fn spill_reading_iterator(
        &self,
        shared: &SpillableShared,
    ) -> Result<u64> {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let cursor = match (&state.upstream, &state.next_upstream) {
            (Upstream::Memory(cursor), None) if state.remaining > 0 => cursor.clone(),
            _ => return Ok(0),
        };

        let run = self.write_run(&cursor, state.remaining)?;
        let reader = run.open_reader()?;

        let mut released = 0u64;
        {
            let mut inner = self.inner.lock();
            inner.runs.push(run);

            // Release every page except the one still backing the last
            // returned record; that one stays pinned until the caller's
            // next load.
            let pinned = if state.loaded { state.current_page } else { None };
            for page in inner.pages.drain(..) {
                if Some(page.number()) == pinned {
                    state.last_page = Some(page);
                } else {
                    released += page.allocated() as u64;
                    self.mem.free_page(page);
                }
            }
            if let Some(current) = inner.current.take() {
                released += current.allocated() as u64;
                self.mem.free_write_page(current);
            }

            // The in-memory index will not be used again.
            if let Some(index) = inner.index.take() {
                released += index.memory_usage();
                index.free();
            }
        }

        state.next_upstream = Some(reader);
        Ok(released)
    }

    /// Writes every record the cursor yields (from its current position)
    /// to a new run file.
    fn write_run(&self, cursor: &SortedCursor, expected: usize) -> Result<SpilledRun> {
        let seq = self.run_seq.fetch_add(1, Ordering::Relaxed);
        let mut writer =
            SpillWriter::create(&self.config.spill_dir, self.id.0, seq, expected)?;
        let mut cursor = cursor.clone();
        while cursor.has_next() {
            cursor.load_next()?;
            writer.write(cursor.record(), cursor.prefix())?;
        }
        writer.finish()
    }

    // ---- shared helpers ----

    fn page_map(pages: &[SealedPage]) -> PageMap {
        pages.iter().map(|p| (p.number(), p.clone())).collect()
    }

    fn take_iterator_slot(&self, inner: &mut SorterInner) -> Result<()> {
        if inner.closed {
            return Err(SortError::SorterClosed);
        }
        if inner.iterator_consumed {
            return Err(SortError::IteratorConsumed);
        }
        inner.iterator_consumed = true;
        if let Some(current) = inner.current.take() {
            inner.pages.push(current.seal());
        }
        Ok(())
    }

    fn in_memory_cursor(&self, inner: &SorterInner) -> Option<SortedCursor> {
        let index = inner.index.as_ref()?;
        if index.num_records() == 0 {
            return None;
        }
        Some(index.sorted_cursor(
            Arc::new(Self::page_map(&inner.pages)),
            &*self.record_cmp,
            &*self.prefix_cmp,
        ))
    }

    fn memory_usage(&self, inner: &SorterInner) -> u64 {
        let pages: u64 = inner.pages.iter().map(|p| p.allocated() as u64).sum();
        let current = inner.current.as_ref().map_or(0, |p| p.allocated() as u64);
        let index = inner.index.as_ref().map_or(0, |ix| ix.memory_usage());
        pages + current + index
    }

    fn update_peak(&self, inner: &SorterInner) {
        self.peak_memory_used
            .fetch_max(self.memory_usage(inner), Ordering::AcqRel);
    }

    /// Frees all pages, returning the number of bytes released.
    fn free_all_pages(&self, inner: &mut SorterInner) -> u64 {
        self.update_peak(inner);
        let mut freed = 0u64;
        for page in inner.pages.drain(..) {
            freed += page.allocated() as u64;
            self.mem.free_page(page);
        }
        if let Some(current) = inner.current.take() {
            freed += current.allocated() as u64;
            self.mem.free_write_page(current);
        }
        freed
    }
}

impl MemoryConsumer for ExternalSorter {
    fn consumer_id(&self) -> ConsumerId {
        self.id
    }

    /// Sorts and spills the current records in response to memory pressure.
    ///
    /// A foreign trigger means the manager is asking on behalf of another
    /// consumer: the request is delegated to the active reading iterator,
    /// or answered with 0 when there is none. A self trigger drains the
    /// in-memory index.
    fn spill(&self, _requested: u64, trigger: ConsumerId) -> Result<u64> {
        if trigger != self.id {
            let shared = self.reading.lock().clone();
            if let Some(shared) = shared {
                return self.spill_reading_iterator(&shared);
            }
            return Ok(0);
        }
        self.spill_in_memory()
    }
}

impl std::fmt::Debug for ExternalSorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExternalSorter")
            .field("id", &self.id)
            .field("pages", &(inner.pages.len() + inner.current.is_some() as usize))
            .field("runs", &inner.runs.len())
            .field(
                "indexed_records",
                &inner.index.as_ref().map_or(0, |ix| ix.num_records()),
            )
            .field("iterator_consumed", &inner.iterator_consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_common::{BytewiseComparator, MemoryConfig, UnsignedPrefixComparator};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        mem: Arc<TaskMemoryManager>,
        ctx: TaskContext,
        config: SorterConfig,
        _dir: TempDir,
    }

    fn create_fixture(budget: usize, page_size: usize, capacity: usize) -> Fixture {
        let dir = tempdir().unwrap();
        Fixture {
            mem: TaskMemoryManager::new(MemoryConfig {
                budget_bytes: budget,
            }),
            ctx: TaskContext::new(),
            config: SorterConfig {
                page_size,
                initial_index_capacity: capacity,
                spill_dir: dir.path().join("spill"),
            },
            _dir: dir,
        }
    }

    fn create_sorter(fixture: &Fixture) -> Arc<ExternalSorter> {
        ExternalSorter::create(
            Arc::clone(&fixture.mem),
            &fixture.ctx,
            Arc::new(BytewiseComparator),
            Arc::new(UnsignedPrefixComparator),
            fixture.config.clone(),
        )
        .unwrap()
    }

    fn drain_prefixes(cursor: &mut dyn RecordCursor) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.has_next() {
            cursor.load_next().unwrap();
            out.push(cursor.prefix());
        }
        out
    }

    fn spill_file_count(config: &SorterConfig) -> usize {
        match std::fs::read_dir(&config.spill_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_in_memory_sorted_output() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        for prefix in [3u64, 1, 4, 1, 5] {
            sorter.insert(&prefix.to_le_bytes(), prefix).unwrap();
        }

        let mut cursor = sorter.sorted_iterator().unwrap();
        assert_eq!(cursor.num_records(), 5);
        assert_eq!(drain_prefixes(&mut *cursor), vec![1, 1, 3, 4, 5]);
        sorter.cleanup_resources();
        assert_eq!(fixture.mem.used_bytes(), 0);
    }

    #[test]
    fn test_spill_on_empty_sorter_returns_zero() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        assert_eq!(sorter.spill(u64::MAX, sorter.id()).unwrap(), 0);
        assert_eq!(spill_file_count(&fixture.config), 0);

        // Drained state behaves the same as empty.
        sorter.insert(b"x", 1).unwrap();
        assert!(sorter.spill(u64::MAX, sorter.id()).unwrap() > 0);
        assert_eq!(sorter.spill(u64::MAX, sorter.id()).unwrap(), 0);
        assert_eq!(spill_file_count(&fixture.config), 1);
    }

    #[test]
    fn test_foreign_spill_without_reading_iterator_returns_zero() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);
        sorter.insert(b"record", 1).unwrap();

        // Foreign trigger, no reading iterator: nothing to give back.
        assert_eq!(sorter.spill(u64::MAX, ConsumerId(u64::MAX)).unwrap(), 0);
        assert_eq!(spill_file_count(&fixture.config), 0);
    }

    #[test]
    fn test_explicit_spill_then_sorted_output() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        for prefix in [9u64, 2, 6] {
            sorter.insert(&prefix.to_le_bytes(), prefix).unwrap();
        }
        // Current page is only partially written; its records must still
        // reach the run.
        let released = sorter.spill(u64::MAX, sorter.id()).unwrap();
        assert!(released > 0);
        assert_eq!(sorter.number_of_allocated_pages(), 0);

        for prefix in [5u64, 3] {
            sorter.insert(&prefix.to_le_bytes(), prefix).unwrap();
        }

        let mut cursor = sorter.sorted_iterator().unwrap();
        assert_eq!(drain_prefixes(&mut *cursor), vec![2, 3, 5, 6, 9]);
        sorter.cleanup_resources();
    }

    #[test]
    fn test_record_too_large() {
        let fixture = create_fixture(1024 * 1024, 64, 16);
        let sorter = create_sorter(&fixture);

        let oversized = vec![0u8; 61];
        assert!(matches!(
            sorter.insert(&oversized, 0),
            Err(SortError::RecordTooLarge { size: 61, max: 64 })
        ));

        // A record that exactly fits is fine.
        sorter.insert(&vec![1u8; 60], 1).unwrap();
        sorter.cleanup_resources();
    }

    #[test]
    fn test_exact_page_fill_forces_new_page() {
        let fixture = create_fixture(1024 * 1024, 68, 16);
        let sorter = create_sorter(&fixture);

        // 64 + 4 bytes exactly fills one page.
        sorter.insert(&[7u8; 64], 1).unwrap();
        assert_eq!(sorter.number_of_allocated_pages(), 1);
        sorter.insert(&[8u8; 64], 2).unwrap();
        assert_eq!(sorter.number_of_allocated_pages(), 2);

        let mut cursor = sorter.sorted_iterator().unwrap();
        cursor.load_next().unwrap();
        assert_eq!(cursor.record(), &[7u8; 64]);
        cursor.load_next().unwrap();
        assert_eq!(cursor.record(), &[8u8; 64]);
        sorter.cleanup_resources();
    }

    #[test]
    fn test_close_current_page() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        sorter.insert(b"a", 1).unwrap();
        assert_eq!(sorter.number_of_allocated_pages(), 1);

        sorter.close_current_page();
        sorter.insert(b"b", 2).unwrap();
        assert_eq!(sorter.number_of_allocated_pages(), 2);
        sorter.cleanup_resources();
    }

    #[test]
    fn test_key_value_records() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        sorter.insert_key_value(b"k1", b"value-one", 2).unwrap();
        sorter.insert_key_value(b"k0", b"value-zero", 1).unwrap();

        let mut cursor = sorter.sorted_iterator().unwrap();
        cursor.load_next().unwrap();
        // [key_len][key][value]
        let record = cursor.record();
        let key_len = u32::from_le_bytes(record[0..4].try_into().unwrap()) as usize;
        assert_eq!(&record[4..4 + key_len], b"k0");
        assert_eq!(&record[4 + key_len..], b"value-zero");
        sorter.cleanup_resources();
    }

    #[test]
    fn test_second_iterator_is_rejected() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);
        sorter.insert(b"a", 1).unwrap();

        let _first = sorter.sorted_iterator().unwrap();
        assert!(matches!(
            sorter.sorted_iterator(),
            Err(SortError::IteratorConsumed)
        ));
        assert!(matches!(
            sorter.insertion_order_iterator(),
            Err(SortError::IteratorConsumed)
        ));
        sorter.cleanup_resources();
    }

    #[test]
    fn test_insert_after_iterator_is_rejected() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);
        sorter.insert(b"a", 1).unwrap();

        let _cursor = sorter.sorted_iterator().unwrap();
        assert!(matches!(
            sorter.insert(b"b", 2),
            Err(SortError::IteratorConsumed)
        ));
        sorter.cleanup_resources();
    }

    #[test]
    fn test_insert_after_cleanup_is_rejected() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);
        sorter.cleanup_resources();

        assert!(matches!(
            sorter.insert(b"a", 1),
            Err(SortError::SorterClosed)
        ));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        sorter.insert(b"a", 1).unwrap();
        sorter.spill(u64::MAX, sorter.id()).unwrap();
        sorter.insert(b"b", 2).unwrap();

        sorter.cleanup_resources();
        sorter.cleanup_resources();
        assert_eq!(fixture.mem.used_bytes(), 0);
        assert_eq!(sorter.number_of_allocated_pages(), 0);
        assert_eq!(spill_file_count(&fixture.config), 0);
    }

    #[test]
    fn test_task_completion_runs_cleanup() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        sorter.insert(b"a", 1).unwrap();
        sorter.spill(u64::MAX, sorter.id()).unwrap();
        assert_eq!(spill_file_count(&fixture.config), 1);

        fixture.ctx.complete();
        assert_eq!(fixture.mem.used_bytes(), 0);
        assert_eq!(spill_file_count(&fixture.config), 0);
    }

    #[test]
    fn test_peak_memory_is_monotonic() {
        let fixture = create_fixture(1024 * 1024, 1024, 16);
        let sorter = create_sorter(&fixture);

        let mut last_peak = 0;
        for i in 0..200u64 {
            sorter.insert(&[0u8; 64], i).unwrap();
            let peak = sorter.peak_memory_used_bytes();
            assert!(peak >= last_peak);
            last_peak = peak;
        }

        sorter.spill(u64::MAX, sorter.id()).unwrap();
        // Spilling frees memory; the reported peak must not go down.
        assert!(sorter.peak_memory_used_bytes() >= last_peak);

        sorter.cleanup_resources();
        assert!(sorter.peak_memory_used_bytes() >= last_peak);
    }

    #[test]
    fn test_zero_length_records_sort_by_prefix() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        for prefix in [5u64, 1, 3] {
            sorter.insert(b"", prefix).unwrap();
        }

        let mut cursor = sorter.sorted_iterator().unwrap();
        assert_eq!(drain_prefixes(&mut *cursor), vec![1, 3, 5]);
        sorter.cleanup_resources();
    }

    #[test]
    fn test_memory_pressure_forces_spills() {
        // Budget fits the index plus a handful of 1 KiB pages, so inserts
        // must repeatedly drain to disk.
        let fixture = create_fixture(8 * 1024, 1024, 64);
        let sorter = create_sorter(&fixture);

        for i in 0..1000u64 {
            sorter.insert(&[0u8; 64], i).unwrap();
        }
        assert!(spill_file_count(&fixture.config) >= 3);

        let mut cursor = sorter.sorted_iterator().unwrap();
        let prefixes = drain_prefixes(&mut *cursor);
        assert_eq!(prefixes.len(), 1000);
        assert!(prefixes.windows(2).all(|w| w[0] <= w[1]));

        sorter.cleanup_resources();
        assert_eq!(fixture.mem.used_bytes(), 0);
        assert_eq!(spill_file_count(&fixture.config), 0);
    }

    #[test]
    fn test_insertion_order_iterator_chains_segments() {
        let fixture = create_fixture(1024 * 1024, 4096, 16);
        let sorter = create_sorter(&fixture);

        for prefix in [3u64, 1, 2] {
            sorter.insert(&prefix.to_le_bytes(), prefix).unwrap();
        }
        sorter.spill(u64::MAX, sorter.id()).unwrap();
        for prefix in [9u64, 7] {
            sorter.insert(&prefix.to_le_bytes(), prefix).unwrap();
        }

        // First the run (sorted within itself), then the in-memory tail.
        let mut cursor = sorter.insertion_order_iterator().unwrap();
        assert_eq!(cursor.num_records(), 5);
        assert_eq!(drain_prefixes(&mut *cursor), vec![1, 2, 3, 7, 9]);
        sorter.cleanup_resources();
    }
}

