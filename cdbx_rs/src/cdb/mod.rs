pub use self::errors::CDBError;
use bytes::{Buf, BufMut, Bytes, IntoBuf};
use failure;

use std::fmt;
use std::io::{Read, Seek, Write};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::result;

pub(crate) mod backing;
pub mod errors;
pub mod input;
pub mod iter;
pub mod reader;
pub mod writer;

pub use self::iter::{Items, Keys, Traverse, Values};
pub use self::reader::Reader;
pub use self::writer::Writer;

pub const STARTING_HASH: u32 = 5381;
pub(crate) const MAIN_TABLE_SIZE: usize = 256;
pub(crate) const MAIN_TABLE_SIZE_BYTES: usize = 2048;
pub(crate) const END_TABLE_ENTRY_SIZE: usize = 8;
pub(crate) const RECORD_HEADER_SIZE: usize = 8;

// a cdb file, offsets included, must fit in u32
pub(crate) const MAX_FILE_SIZE: u64 = 0xffff_ffff;

pub type Result<T> = result::Result<T, failure::Error>;

#[inline]
pub fn pack_u32_le(x: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    {
        let mut cur = std::io::Cursor::new(&mut buf[..]);
        cur.put_u32_le(x);
    }
    buf
}

#[inline]
pub fn unpack_u32_le(buf: &[u8]) -> u32 {
    (&buf[..4]).into_buf().get_u32_le()
}

// range check at the public boundary: lengths and offsets live in u32 space
#[inline]
pub(crate) fn check_u32(n: u64) -> Result<u32> {
    if n > MAX_FILE_SIZE {
        Err(CDBError::overflow(n).into())
    } else {
        Ok(n as u32)
    }
}

pub trait SeekRead: Read + Seek {}
impl<T: Read + Seek> SeekRead for T {}

pub trait SeekReadWrite: Read + Write + Seek {}
impl<T: Read + Write + Seek> SeekReadWrite for T {}

/// Where a [`Reader`] gets its bytes from.
pub enum Source {
    Path(PathBuf),
    Fd(RawFd),
    Stream(Box<dyn SeekRead>),
}

impl From<PathBuf> for Source {
    fn from(pb: PathBuf) -> Self {
        Source::Path(pb)
    }
}

impl<'a> From<&'a Path> for Source {
    fn from(p: &'a Path) -> Self {
        Source::Path(p.to_path_buf())
    }
}

impl<'a> From<&'a str> for Source {
    fn from(s: &'a str) -> Self {
        Source::Path(PathBuf::from(s))
    }
}

impl From<RawFd> for Source {
    fn from(fd: RawFd) -> Self {
        Source::Fd(fd)
    }
}

impl From<Box<dyn SeekRead>> for Source {
    fn from(s: Box<dyn SeekRead>) -> Self {
        Source::Stream(s)
    }
}

/// Where a [`Writer`] puts its bytes.
pub enum Target {
    Path(PathBuf),
    Fd(RawFd),
    Stream(Box<dyn SeekReadWrite>),
}

impl From<PathBuf> for Target {
    fn from(pb: PathBuf) -> Self {
        Target::Path(pb)
    }
}

impl<'a> From<&'a Path> for Target {
    fn from(p: &'a Path) -> Self {
        Target::Path(p.to_path_buf())
    }
}

impl<'a> From<&'a str> for Target {
    fn from(s: &'a str) -> Self {
        Target::Path(PathBuf::from(s))
    }
}

impl From<RawFd> for Target {
    fn from(fd: RawFd) -> Self {
        Target::Fd(fd)
    }
}

impl From<Box<dyn SeekReadWrite>> for Target {
    fn from(s: Box<dyn SeekReadWrite>) -> Self {
        Target::Stream(s)
    }
}

/// Three-valued option. `Default` defers to the per-call policy, so
/// "unspecified" stays distinguishable from "explicitly off".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Toggle {
    Default,
    Enabled,
    Disabled,
}

impl Default for Toggle {
    fn default() -> Toggle {
        Toggle::Default
    }
}

impl Toggle {
    #[inline]
    pub(crate) fn unwrap_or(self, default: bool) -> bool {
        match self {
            Toggle::Default => default,
            Toggle::Enabled => true,
            Toggle::Disabled => false,
        }
    }
}

impl From<bool> for Toggle {
    fn from(b: bool) -> Toggle {
        if b {
            Toggle::Enabled
        } else {
            Toggle::Disabled
        }
    }
}

impl From<Option<bool>> for Toggle {
    fn from(b: Option<bool>) -> Toggle {
        match b {
            None => Toggle::Default,
            Some(b) => b.into(),
        }
    }
}

/// Construction options shared by [`Reader`] and [`Writer`].
///
/// `close` controls descriptor ownership when constructing from a raw fd:
/// `Enabled` means closing the handle closes the descriptor. `mmap`
/// selects the backing mode: `Enabled` requires a mapping and fails if
/// one cannot be made, `Disabled` never maps, `Default` tries to map and
/// silently falls back to positional reads.
#[derive(Copy, Clone, Debug, Default)]
pub struct Options {
    pub close: Toggle,
    pub mmap: Toggle,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    pub fn close<T: Into<Toggle>>(mut self, t: T) -> Options {
        self.close = t.into();
        self
    }

    pub fn mmap<T: Into<Toggle>>(mut self, t: T) -> Options {
        self.mmap = t.into();
        self
    }
}

// idea from https://raw.githubusercontent.com/jothan/cordoba/master/src/lib.rs
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct CDBHash(u32);

impl CDBHash {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        let mut h = STARTING_HASH;

        for b in bytes {
            // wrapping here is explicitly for allowing overflow semantics:
            //
            //   Operations like + on u32 values is intended to never overflow,
            //   and in some debug configurations overflow is detected and results in a panic.
            //   While most arithmetic falls into this category, some code explicitly expects
            //   and relies upon modular arithmetic (e.g., hashing)
            //
            h = h.wrapping_shl(5).wrapping_add(h) ^ (*b as u32)
        }
        CDBHash(h)
    }

    #[inline]
    pub(crate) fn table(&self) -> usize {
        self.0 as usize % MAIN_TABLE_SIZE
    }

    #[inline]
    pub(crate) fn slot(&self, num_ents: usize) -> usize {
        (self.0 as usize >> 8) % num_ents
    }

    #[inline]
    pub(crate) fn inner(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CDBHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CDBHash(0x{:08x})", self.0)
    }
}

impl From<u32> for CDBHash {
    #[inline]
    fn from(h: u32) -> Self {
        CDBHash(h)
    }
}

impl<'a> From<&'a CDBHash> for u32 {
    #[inline]
    fn from(h: &'a CDBHash) -> Self {
        h.0
    }
}

/// One entry of the 2048-byte main table: the absolute offset of a
/// bucket's index subtable and its slot count.
#[derive(Copy, Clone, Default)]
pub(crate) struct Bucket {
    pub(crate) ptr: u32,
    pub(crate) num_ents: u32,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "Bucket {{ ptr: {:>#010x}, num_ents: {:>#010x} }}",
            self.ptr, self.num_ents
        )
    }
}

impl Bucket {
    // returns the offset into the db of entry n of this bucket.
    // panics if n >= num_ents
    pub(crate) fn entry_n_pos(&self, n: usize) -> IndexEntryPos {
        assert!(n < self.num_ents as usize);
        IndexEntryPos(self.ptr as usize + (n * END_TABLE_ENTRY_SIZE))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct IndexEntryPos(pub(crate) usize);

impl From<IndexEntryPos> for usize {
    fn from(n: IndexEntryPos) -> Self {
        n.0
    }
}

/// An owned key/value pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KV {
    pub k: Bytes,
    pub v: Bytes,
}

#[derive(Copy, Clone, Default)]
pub(crate) struct IndexEntry {
    pub(crate) hash: CDBHash, // the hash of the stored key
    pub(crate) ptr: u32,      // pointer to the absolute position of the data in the db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_empty_input_is_the_starting_value() {
        assert_eq!(CDBHash::new(b"").inner(), STARTING_HASH);
    }

    #[test]
    fn hash_vectors() {
        // h = ((h << 5) + h) ^ b, starting from 5381
        assert_eq!(CDBHash::new(b"\x00").inner(), 177_573);
        assert_eq!(CDBHash::new(b"hello").inner(), 178_056_679);
    }

    #[test]
    fn hash_bucket_and_slot() {
        let h = CDBHash::new(b"a");
        assert_eq!(h.inner(), 177_604);
        assert_eq!(h.table(), 177_604 % 256);
        assert_eq!(h.slot(4), (177_604 >> 8) % 4);
    }

    #[test]
    fn pack_unpack_round_trip() {
        for &x in &[0u32, 1, 2048, 0xdead_beef, 0xffff_ffff] {
            assert_eq!(unpack_u32_le(&pack_u32_le(x)), x);
        }
        assert_eq!(pack_u32_le(0x0403_0201), [1, 2, 3, 4]);
    }

    #[test]
    fn check_u32_rejects_out_of_range() {
        assert_eq!(check_u32(MAX_FILE_SIZE).unwrap(), 0xffff_ffff);
        let err = check_u32(MAX_FILE_SIZE + 1).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::Overflow { value }) => assert_eq!(value, MAX_FILE_SIZE + 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn toggle_defaulting() {
        assert_eq!(Toggle::default(), Toggle::Default);
        assert!(Toggle::Default.unwrap_or(true));
        assert!(!Toggle::Default.unwrap_or(false));
        assert!(Toggle::Enabled.unwrap_or(false));
        assert!(!Toggle::Disabled.unwrap_or(true));
        assert_eq!(Toggle::from(Some(true)), Toggle::Enabled);
        assert_eq!(Toggle::from(None), Toggle::Default);
    }
}
