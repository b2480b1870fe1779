//! Mid-consumption spillable wrapper around the in-memory sorted cursor.
//!
//! The caller owns a `SpillableCursor`; the sorter keeps the companion
//! `SpillableShared` handle so a memory-pressure callback arriving on
//! another thread can spill the unread tail. Lock order is fixed: the
//! iterator monitor here is always acquired before the sorter monitor,
//! never after.

use crate::index::SortedCursor;
use bytes::Bytes;
use parking_lot::Mutex;
use silt_common::{RecordCursor, Result, SealedPage, SortError};
use silt_memory::TaskMemoryManager;
use silt_spill::SpillRunReader;
use std::sync::Arc;

/// Source currently feeding the cursor.
pub(crate) enum Upstream {
    /// Still reading from the cloned in-memory cursor.
    Memory(SortedCursor),
    /// Swapped over to a spill-run reader.
    Run(SpillRunReader),
}

/// State guarded by the iterator monitor.
pub(crate) struct SpillableState {
    pub upstream: Upstream,
    /// Reader produced by a spill, adopted at the next `load_next`.
    pub next_upstream: Option<SpillRunReader>,
    /// Page backing the last returned record, kept live across a spill
    /// until the caller advances.
    pub last_page: Option<SealedPage>,
    /// Page number backing the current record while reading from memory.
    pub current_page: Option<u32>,
    /// Unread records.
    pub remaining: usize,
    /// True once the caller has loaded at least one record.
    pub loaded: bool,
}

/// Handle shared between the caller-owned cursor and the sorter.
pub struct SpillableShared {
    pub(crate) state: Mutex<SpillableState>,
    pub(crate) mem: Arc<TaskMemoryManager>,
}

impl SpillableShared {
    pub(crate) fn new(cursor: SortedCursor, mem: Arc<TaskMemoryManager>) -> Arc<Self> {
        let remaining = cursor.num_records();
        Arc::new(Self {
            state: Mutex::new(SpillableState {
                upstream: Upstream::Memory(cursor),
                next_upstream: None,
                last_page: None,
                current_page: None,
                remaining,
                loaded: false,
            }),
            mem,
        })
    }

    /// Releases everything the iterator still holds.
    ///
    /// Called during sorter cleanup so a page pinned between a
    /// mid-iteration spill and the next `load_next` cannot outlive the
    /// sorter.
    pub(crate) fn release_resources(&self) {
        let mut state = self.state.lock();
        if let Some(page) = state.last_page.take() {
            self.mem.free_page(page);
        }
        state.next_upstream = None;
        state.remaining = 0;
    }
}

/// Caller-facing cursor over the spillable stream.
pub struct SpillableCursor {
    shared: Arc<SpillableShared>,
    num_records: usize,
    current: Option<(Bytes, u64)>,
}

impl SpillableCursor {
    pub(crate) fn new(shared: Arc<SpillableShared>, num_records: usize) -> Self {
        Self {
            shared,
            num_records,
            current: None,
        }
    }
}

impl RecordCursor for SpillableCursor {
    fn num_records(&self) -> usize {
        self.num_records
    }

    fn has_next(&self) -> bool {
        self.shared.state.lock().remaining > 0
    }

    fn load_next(&mut self) -> Result<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.loaded = true;

        if let Some(reader) = state.next_upstream.take() {
            // Just consumed the last record served from memory; the page it
            // lived on can finally go back to the manager.
            if let Some(page) = state.last_page.take() {
                self.shared.mem.free_page(page);
            }
            state.upstream = Upstream::Run(reader);
            state.current_page = None;
        }

        if state.remaining == 0 {
            return Err(SortError::Internal(
                "spillable cursor advanced past its last record".to_string(),
            ));
        }
        state.remaining -= 1;

        let current = match &mut state.upstream {
            Upstream::Memory(cursor) => {
                cursor.load_next()?;
                state.current_page = cursor.current_page();
                cursor.current_handle()
            }
            Upstream::Run(reader) => {
                reader.load_next()?;
                (reader.current_bytes(), reader.prefix())
            }
        };
        drop(guard);

        self.current = Some(current);
        Ok(())
    }

    fn record(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|(record, _)| record.as_ref())
            .unwrap_or(&[])
    }

    fn prefix(&self) -> u64 {
        self.current.as_ref().map(|(_, prefix)| *prefix).unwrap_or(0)
    }
}
