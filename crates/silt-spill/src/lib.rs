//! Spill-run storage for the Silt sorting engine.
//!
//! Provides the on-disk run format, a buffered run writer, a verifying
//! run reader, and a k-way merger that re-establishes the global sort
//! order across runs.

mod merger;
mod reader;
mod writer;

pub use merger::{MergedCursor, RunMerger};
pub use reader::SpillRunReader;
pub use writer::{SpillWriter, SpilledRun, FRAME_OVERHEAD, RUN_HEADER_SIZE};
