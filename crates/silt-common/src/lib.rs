//! Silt common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Silt components.

pub mod config;
pub mod cursor;
pub mod error;
pub mod page;

pub use config::{MemoryConfig, SorterConfig, DEFAULT_PAGE_SIZE};
pub use cursor::{
    BytewiseComparator, PrefixComparator, RecordComparator, RecordCursor,
    SignedPrefixComparator, UnsignedPrefixComparator,
};
pub use error::{Result, SortError};
pub use page::{RecordAddress, SealedPage, WritePage};
