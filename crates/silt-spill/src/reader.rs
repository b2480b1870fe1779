//! Spill run reader.

use bytes::Bytes;
use silt_common::{RecordCursor, Result, SortError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Streams record frames back out of a run file.
///
/// Each `load_next` reads one frame into an owned buffer and verifies its
/// checksum, so a truncated or corrupted run surfaces as `SpillCorrupted`
/// rather than garbage records.
pub struct SpillRunReader {
    file: BufReader<File>,
    path: PathBuf,
    num_records: usize,
    read: usize,
    current: Bytes,
    prefix: u64,
}

impl SpillRunReader {
    /// Opens a run file and reads its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 4];
        reader.read_exact(&mut header).map_err(|_| SortError::SpillCorrupted {
            path: path.display().to_string(),
            reason: "missing run header".to_string(),
        })?;
        let num_records = u32::from_le_bytes(header) as usize;

        Ok(Self {
            file: reader,
            path: path.to_path_buf(),
            num_records,
            read: 0,
            current: Bytes::new(),
            prefix: 0,
        })
    }

    /// Returns the current record as a cheaply cloneable handle.
    pub fn current_bytes(&self) -> Bytes {
        self.current.clone()
    }

    fn corrupted(&self, reason: impl Into<String>) -> SortError {
        SortError::SpillCorrupted {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl RecordCursor for SpillRunReader {
    fn num_records(&self) -> usize {
        self.num_records
    }

    fn has_next(&self) -> bool {
        self.read < self.num_records
    }

    fn load_next(&mut self) -> Result<()> {
        let mut frame_header = [0u8; 12];
        self.file
            .read_exact(&mut frame_header)
            .map_err(|_| self.corrupted("truncated record header"))?;

        let len = u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]) as usize;
        let prefix = u64::from_le_bytes([
            frame_header[4],
            frame_header[5],
            frame_header[6],
            frame_header[7],
            frame_header[8],
            frame_header[9],
            frame_header[10],
            frame_header[11],
        ]);

        let mut payload = vec![0u8; len];
        self.file
            .read_exact(&mut payload)
            .map_err(|_| self.corrupted("truncated record payload"))?;

        let mut stored = [0u8; 4];
        self.file
            .read_exact(&mut stored)
            .map_err(|_| self.corrupted("truncated record checksum"))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame_header);
        hasher.update(&payload);
        let computed = hasher.finalize();
        let stored = u32::from_le_bytes(stored);
        if stored != computed {
            return Err(self.corrupted(format!(
                "checksum mismatch: stored={stored}, computed={computed}"
            )));
        }

        self.current = Bytes::from(payload);
        self.prefix = prefix;
        self.read += 1;
        Ok(())
    }

    fn record(&self) -> &[u8] {
        &self.current
    }

    fn prefix(&self) -> u64 {
        self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SpillWriter;
    use tempfile::tempdir;

    #[test]
    fn test_read_back_records() {
        let dir = tempdir().unwrap();
        let mut writer = SpillWriter::create(dir.path(), 1, 0, 3).unwrap();
        writer.write(b"apple", 3).unwrap();
        writer.write(b"banana", 1).unwrap();
        writer.write(b"", 9).unwrap();
        let run = writer.finish().unwrap();

        let mut reader = run.open_reader().unwrap();
        assert_eq!(reader.num_records(), 3);

        reader.load_next().unwrap();
        assert_eq!(reader.record(), b"apple");
        assert_eq!(reader.prefix(), 3);

        reader.load_next().unwrap();
        assert_eq!(reader.record(), b"banana");
        assert_eq!(reader.prefix(), 1);

        reader.load_next().unwrap();
        assert!(reader.record().is_empty());
        assert_eq!(reader.prefix(), 9);

        assert!(!reader.has_next());
    }

    #[test]
    fn test_empty_run_has_no_records() {
        let dir = tempdir().unwrap();
        let run = SpillWriter::create(dir.path(), 1, 0, 0)
            .unwrap()
            .finish()
            .unwrap();

        let reader = run.open_reader().unwrap();
        assert_eq!(reader.num_records(), 0);
        assert!(!reader.has_next());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = tempdir().unwrap();
        let mut writer = SpillWriter::create(dir.path(), 1, 0, 1).unwrap();
        writer.write(b"important", 7).unwrap();
        let run = writer.finish().unwrap();

        // Flip a byte in the payload area.
        let mut data = std::fs::read(run.path()).unwrap();
        data[18] ^= 0xFF;
        std::fs::write(run.path(), &data).unwrap();

        let mut reader = run.open_reader().unwrap();
        let result = reader.load_next();
        assert!(matches!(result, Err(SortError::SpillCorrupted { .. })));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = tempdir().unwrap();
        let mut writer = SpillWriter::create(dir.path(), 1, 0, 1).unwrap();
        writer.write(b"record", 1).unwrap();
        let run = writer.finish().unwrap();

        let data = std::fs::read(run.path()).unwrap();
        std::fs::write(run.path(), &data[..data.len() - 2]).unwrap();

        let mut reader = run.open_reader().unwrap();
        assert!(matches!(
            reader.load_next(),
            Err(SortError::SpillCorrupted { .. })
        ));
    }

    #[test]
    fn test_missing_header_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.spill");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            SpillRunReader::open(&path),
            Err(SortError::SpillCorrupted { .. })
        ));
    }
}
