//! Spill run writer.
//!
//! A run holds one sorted sequence of records with their prefixes,
//! produced atomically from a single drain of the in-memory index.
//!
//! File format:
//! - header: record count (4 bytes, patched on finish)
//! - per record:
//!   - payload length: 4 bytes
//!   - prefix: 8 bytes
//!   - payload: variable length
//!   - checksum: 4 bytes (CRC32 of length + prefix + payload)
//!
//! All integers are little-endian.

use bytes::{BufMut, BytesMut};
use silt_common::Result;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the run header in bytes.
pub const RUN_HEADER_SIZE: usize = 4;
/// Per-record framing overhead in bytes (length + prefix + checksum).
pub const FRAME_OVERHEAD: usize = 16;

/// Appends sorted records to a new run file.
pub struct SpillWriter {
    file: BufWriter<File>,
    path: PathBuf,
    written: u32,
}

impl SpillWriter {
    /// Creates a run file under `dir`.
    ///
    /// `expected_records` is a sizing hint; the header is written as a
    /// placeholder and patched with the actual count on `finish`, so
    /// writing fewer records than expected is fine.
    pub fn create(
        dir: &Path,
        consumer: u64,
        seq: u64,
        expected_records: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("sort-{consumer}-run-{seq:06}.spill"));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&(expected_records as u32).to_le_bytes())?;

        Ok(Self {
            file: writer,
            path,
            written: 0,
        })
    }

    /// Returns the run file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records written so far.
    pub fn num_records_written(&self) -> usize {
        self.written as usize
    }

    /// Appends one record frame.
    pub fn write(&mut self, record: &[u8], prefix: u64) -> Result<()> {
        let mut frame = BytesMut::with_capacity(record.len() + FRAME_OVERHEAD);
        frame.put_u32_le(record.len() as u32);
        frame.put_u64_le(prefix);
        frame.put_slice(record);
        let checksum = crc32fast::hash(&frame);
        frame.put_u32_le(checksum);

        self.file.write_all(&frame)?;
        self.written += 1;
        Ok(())
    }

    /// Flushes the file and patches the header with the actual count.
    pub fn finish(self) -> Result<SpilledRun> {
        let mut file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.written.to_le_bytes())?;
        file.flush()?;

        Ok(SpilledRun {
            path: self.path,
            num_records: self.written as usize,
        })
    }
}

/// A closed, immutable spill run.
#[derive(Debug, Clone)]
pub struct SpilledRun {
    path: PathBuf,
    num_records: usize,
}

impl SpilledRun {
    /// Returns the run file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records in the run.
    pub fn num_records(&self) -> usize {
        self.num_records
    }

    /// Opens a reader positioned before the first record.
    pub fn open_reader(&self) -> Result<crate::reader::SpillRunReader> {
        crate::reader::SpillRunReader::open(&self.path)
    }

    /// Deletes the run file.
    pub fn remove_file(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
