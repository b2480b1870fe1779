//! Record pages and address encoding.
//!
//! Pages are append-only byte buffers owned by a sorter. A record is laid
//! out as a 4-byte little-endian length word followed by its payload;
//! key/value records nest a second length word inside the payload. Once a
//! page is sealed its contents are served as zero-copy `Bytes` slices.

use bytes::{BufMut, Bytes, BytesMut};

/// Opaque handle for a record within a sorter's page set.
///
/// Packs a page number and an intra-page byte offset into a single u64.
/// Dereferencing requires the owning page to still be live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordAddress(u64);

impl RecordAddress {
    /// Creates an address from a page number and intra-page offset.
    pub fn new(page: u32, offset: u32) -> Self {
        Self(((page as u64) << 32) | (offset as u64))
    }

    /// Returns the page number portion of this address.
    pub fn page(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the intra-page byte offset.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the address as a raw u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Creates an address from its raw u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for RecordAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page(), self.offset())
    }
}

/// An append-only page currently accepting record writes.
///
/// The write cursor is the buffer length; records are never overwritten
/// and intra-page fragmentation is never reclaimed.
#[derive(Debug)]
pub struct WritePage {
    number: u32,
    buf: BytesMut,
    /// Bytes reserved from the memory manager for this page.
    allocated: usize,
    /// Append limit; normally equal to `allocated`, forced down to the
    /// cursor by `close` so the next insert acquires a fresh page.
    limit: usize,
}

impl WritePage {
    /// Creates an empty page of the given capacity.
    pub fn new(number: u32, capacity: usize) -> Self {
        Self {
            number,
            buf: BytesMut::with_capacity(capacity),
            allocated: capacity,
            limit: capacity,
        }
    }

    /// Returns the page number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the bytes reserved for this page.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Returns the current write cursor.
    pub fn cursor(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Returns true if `required` more bytes fit on this page.
    pub fn has_space(&self, required: usize) -> bool {
        self.buf.len() + required <= self.limit
    }

    /// Forces the cursor to the page end so the next insert acquires a
    /// fresh page.
    pub fn close(&mut self) {
        self.limit = self.buf.len();
    }

    /// Appends a plain record and returns its starting offset.
    ///
    /// Layout: `[len: u32 LE][payload]`. Caller must have checked
    /// `has_space(payload.len() + 4)`.
    pub fn append_record(&mut self, payload: &[u8]) -> u32 {
        debug_assert!(self.has_space(payload.len() + 4));
        let offset = self.cursor();
        self.buf.put_u32_le(payload.len() as u32);
        self.buf.put_slice(payload);
        offset
    }

    /// Appends a key/value record and returns its starting offset.
    ///
    /// Layout: `[total: u32 LE][key_len: u32 LE][key][value]` where
    /// `total = key_len + value_len + 4`.
    pub fn append_key_value(&mut self, key: &[u8], value: &[u8]) -> u32 {
        debug_assert!(self.has_space(key.len() + value.len() + 8));
        let offset = self.cursor();
        self.buf.put_u32_le((key.len() + value.len() + 4) as u32);
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_slice(value);
        offset
    }

    /// Seals this page, freezing its contents for zero-copy reads.
    pub fn seal(self) -> SealedPage {
        SealedPage {
            number: self.number,
            data: self.buf.freeze(),
            allocated: self.allocated,
        }
    }
}

/// A sealed page whose records can be sliced without copying.
#[derive(Debug, Clone)]
pub struct SealedPage {
    number: u32,
    data: Bytes,
    allocated: usize,
}

impl SealedPage {
    /// Returns the page number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the bytes reserved for this page.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Returns the written portion of the page.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the record payload starting at `offset`.
    ///
    /// Reads the leading length word and slices past it, so the result is
    /// exactly what was passed to `append_record` (or, for key/value
    /// records, the `[key_len][key][value]` region).
    pub fn record_at(&self, offset: u32) -> Bytes {
        let start = offset as usize;
        let len = u32::from_le_bytes([
            self.data[start],
            self.data[start + 1],
            self.data[start + 2],
            self.data[start + 3],
        ]) as usize;
        self.data.slice(start + 4..start + 4 + len)
    }
}
