//! Sequential chaining of record cursors.

use silt_common::{RecordCursor, Result, SortError};
use std::collections::VecDeque;

/// Consumes a queue of cursors one after another.
///
/// Backs the insertion-order output path: spill runs in registry order,
/// then the in-memory tail. Exhausted sources are skipped transparently.
pub struct ChainedCursor {
    sources: VecDeque<Box<dyn RecordCursor>>,
    current: Option<Box<dyn RecordCursor>>,
    num_records: usize,
}

impl ChainedCursor {
    /// Chains the given sources in order.
    pub fn new(sources: Vec<Box<dyn RecordCursor>>) -> Self {
        let num_records = sources.iter().map(|s| s.num_records()).sum();
        let mut sources: VecDeque<_> = sources.into();
        let current = sources.pop_front();
        Self {
            sources,
            current,
            num_records,
        }
    }
}

impl RecordCursor for ChainedCursor {
    fn num_records(&self) -> usize {
        self.num_records
    }

    fn has_next(&self) -> bool {
        self.current.as_ref().map_or(false, |c| c.has_next())
            || self.sources.iter().any(|s| s.has_next())
    }

    fn load_next(&mut self) -> Result<()> {
        loop {
            match self.current.as_mut() {
                Some(current) if current.has_next() => return current.load_next(),
                _ => {
                    self.current = Some(self.sources.pop_front().ok_or_else(|| {
                        SortError::Internal(
                            "chained cursor advanced past its last record".to_string(),
                        )
                    })?);
                }
            }
        }
    }

    fn record(&self) -> &[u8] {
        self.current.as_ref().map(|c| c.record()).unwrap_or(&[])
    }

    fn prefix(&self) -> u64 {
        self.current.as_ref().map(|c| c.prefix()).unwrap_or(0)
    }
}
