//! Index chunk codec: exact appearance tables.
//!
//! Layout (little-endian):
//! - header: `magic: u32`, `version_hash: [u8; 32]`, `address_count: u32`,
//!   `appearance_count: u32`
//! - address table: `address_count` x `{address: [u8; 20], offset: u32, count: u32}`
//!   sorted by address
//! - appearance table: `appearance_count` x `{block_number: u32, transaction_index: u32}`

use super::bloom::format_version_hash;
use crate::error::{IndexError, Result};
use alloy_primitives::Address;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const INDEX_MAGIC: u32 = 0xdead_beef;
pub const INDEX_HEADER_WIDTH: usize = 4 + 32 + 4 + 4;
pub const ADDRESS_RECORD_WIDTH: usize = 20 + 4 + 4;
pub const APPEARANCE_RECORD_WIDTH: usize = 4 + 4;

/// One `(block, transaction)` location where an address appeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppearanceRecord {
    pub block_number: u32,
    pub transaction_index: u32,
}

impl AppearanceRecord {
    pub const fn new(block_number: u32, transaction_index: u32) -> Self {
        Self {
            block_number,
            transaction_index,
        }
    }

    fn from_bytes(buf: &[u8; APPEARANCE_RECORD_WIDTH]) -> Self {
        Self {
            block_number: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            transaction_index: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Address table entry pointing into the appearance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: Address,
    pub offset: u32,
    pub count: u32,
}

impl AddressRecord {
    fn from_bytes(buf: &[u8; ADDRESS_RECORD_WIDTH]) -> Self {
        Self {
            address: Address::from_slice(&buf[..20]),
            offset: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            count: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub address_count: u32,
    pub appearance_count: u32,
}

impl IndexHeader {
    pub fn app_table_start(&self) -> u64 {
        INDEX_HEADER_WIDTH as u64 + u64::from(self.address_count) * ADDRESS_RECORD_WIDTH as u64
    }

    /// Size a well-formed file with this header must have.
    pub fn expected_file_len(&self) -> u64 {
        self.app_table_start() + u64::from(self.appearance_count) * APPEARANCE_RECORD_WIDTH as u64
    }
}

pub(crate) fn parse_index_header(
    buf: &[u8; INDEX_HEADER_WIDTH],
    path: &Path,
) -> Result<IndexHeader> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != INDEX_MAGIC {
        return Err(IndexError::decode(path, format!("bad index magic {magic:#010x}")));
    }
    if buf[4..36] != format_version_hash() {
        return Err(IndexError::decode(path, "unsupported index format version"));
    }
    Ok(IndexHeader {
        address_count: u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]),
        appearance_count: u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]),
    })
}

/// Open handle on an index chunk. The file closes when the handle drops.
#[derive(Debug)]
pub struct IndexChunk {
    path: PathBuf,
    reader: BufReader<File>,
    header: IndexHeader,
    file_len: u64,
}

impl IndexChunk {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| IndexError::io(path, err))?;
        let file_len = file
            .metadata()
            .map_err(|err| IndexError::io(path, err))?
            .len();
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; INDEX_HEADER_WIDTH];
        reader.read_exact(&mut buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => IndexError::decode(path, "index header truncated"),
            _ => IndexError::io(path, err),
        })?;
        let header = parse_index_header(&buf, path)?;
        if file_len < header.app_table_start() {
            return Err(IndexError::decode(
                path,
                format!(
                    "address table truncated: need {} bytes, file has {file_len}",
                    header.app_table_start()
                ),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            file_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> IndexHeader {
        self.header
    }

    pub fn app_table_start(&self) -> u64 {
        self.header.app_table_start()
    }

    /// Positions the reader at the appearance table and returns a lazy
    /// iterator over every record in file order.
    pub fn seek_to_appearances(&mut self) -> Result<Appearances<'_>> {
        let start = self.app_table_start();
        self.seek(start)?;
        let remaining = self.header.appearance_count;
        Ok(Appearances {
            chunk: self,
            remaining,
            failed: false,
        })
    }

    /// Exact appearances of one address, found by binary search of the
    /// address table. Empty when the address is not in this chunk.
    pub fn lookup(&mut self, address: &Address) -> Result<Vec<AppearanceRecord>> {
        let Some(record) = self.find_address(address)? else {
            return Ok(Vec::new());
        };
        let end = u64::from(record.offset) + u64::from(record.count);
        if end > u64::from(self.header.appearance_count) {
            return Err(IndexError::decode(
                &self.path,
                format!(
                    "address {address} points past the appearance table ({end} > {})",
                    self.header.appearance_count
                ),
            ));
        }
        let start =
            self.app_table_start() + u64::from(record.offset) * APPEARANCE_RECORD_WIDTH as u64;
        let slice_end = start + u64::from(record.count) * APPEARANCE_RECORD_WIDTH as u64;
        if slice_end > self.file_len {
            return Err(IndexError::decode(
                &self.path,
                format!(
                    "appearances of {address} end at byte {slice_end}, file has {}",
                    self.file_len
                ),
            ));
        }
        self.seek(start)?;
        let mut out = Vec::with_capacity(record.count as usize);
        let mut buf = [0u8; APPEARANCE_RECORD_WIDTH];
        for _ in 0..record.count {
            self.read_record(&mut buf)?;
            out.push(AppearanceRecord::from_bytes(&buf));
        }
        Ok(out)
    }

    /// Every address table entry, in file order. `open` already checked the
    /// table fits in the file.
    pub fn addresses(&mut self) -> Result<Vec<AddressRecord>> {
        self.seek(INDEX_HEADER_WIDTH as u64)?;
        let mut out = Vec::with_capacity(self.header.address_count as usize);
        let mut buf = [0u8; ADDRESS_RECORD_WIDTH];
        for _ in 0..self.header.address_count {
            self.read_record(&mut buf)?;
            out.push(AddressRecord::from_bytes(&buf));
        }
        Ok(out)
    }

    fn find_address(&mut self, address: &Address) -> Result<Option<AddressRecord>> {
        let mut lo = 0u64;
        let mut hi = u64::from(self.header.address_count);
        let mut buf = [0u8; ADDRESS_RECORD_WIDTH];
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.seek(INDEX_HEADER_WIDTH as u64 + mid * ADDRESS_RECORD_WIDTH as u64)?;
            self.read_record(&mut buf)?;
            let record = AddressRecord::from_bytes(&buf);
            match record.address.cmp(address) {
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|err| IndexError::io(&self.path, err))
    }

    fn read_record(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => IndexError::decode(&self.path, "record truncated"),
            _ => IndexError::io(&self.path, err),
        })
    }
}

/// Lazy appearance decoder. The first framing error is yielded once and the
/// iterator then ends: nothing after a broken record can be trusted.
#[derive(Debug)]
pub struct Appearances<'a> {
    chunk: &'a mut IndexChunk,
    remaining: u32,
    failed: bool,
}

impl Iterator for Appearances<'_> {
    type Item = Result<AppearanceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        let mut buf = [0u8; APPEARANCE_RECORD_WIDTH];
        match self.chunk.read_record(&mut buf) {
            Ok(()) => {
                self.remaining -= 1;
                Some(Ok(AppearanceRecord::from_bytes(&buf)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.remaining as usize))
        }
    }
}

/// Encodes an index chunk. Addresses are laid out in ascending order and each
/// address's appearances ascending by `(block, transaction)`.
pub fn encode_index_chunk(entries: &BTreeMap<Address, Vec<AppearanceRecord>>) -> Vec<u8> {
    let appearance_count: usize = entries.values().map(Vec::len).sum();
    let mut out = Vec::with_capacity(
        INDEX_HEADER_WIDTH
            + entries.len() * ADDRESS_RECORD_WIDTH
            + appearance_count * APPEARANCE_RECORD_WIDTH,
    );
    out.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
    out.extend_from_slice(&format_version_hash());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(appearance_count as u32).to_le_bytes());

    let mut offset = 0u32;
    for (address, apps) in entries {
        out.extend_from_slice(address.as_slice());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(apps.len() as u32).to_le_bytes());
        offset += apps.len() as u32;
    }
    for apps in entries.values() {
        let mut sorted = apps.clone();
        sorted.sort();
        for app in sorted {
            out.extend_from_slice(&app.block_number.to_le_bytes());
            out.extend_from_slice(&app.transaction_index.to_le_bytes());
        }
    }
    out
}
