use bytes::Bytes;

use std::cell::{Cell, RefCell};
use std::cmp;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use cdb::backing::Backing;
use cdb::errors::CDBError;
use cdb::iter::{Items, Keys, Traverse, Values};
use cdb::{
    check_u32, unpack_u32_le, Bucket, CDBHash, IndexEntry, IndexEntryPos, Options, Result,
    Source, END_TABLE_ENTRY_SIZE, MAIN_TABLE_SIZE, MAIN_TABLE_SIZE_BYTES, RECORD_HEADER_SIZE,
};

/// Shared state behind a [`Reader`] and any iterators derived from it.
///
/// The backing sits in a `RefCell<Option<..>>`: `None` is the closed
/// state, and the cell gives stream mode the interior mutability its
/// seek+read cycle needs. Iterators hold a `Weak` on this block, so a
/// dropped reader is observable as a failed upgrade.
pub(crate) struct Core {
    backing: RefCell<Option<Backing>>,
    table: [Bucket; MAIN_TABLE_SIZE],
    // first byte past the records region, i.e. the lowest subtable offset
    pub(crate) end: u32,
    size: u32,
    num_keys: Cell<Option<usize>>,
}

impl Core {
    pub(crate) fn is_closed(&self) -> bool {
        self.backing.borrow().is_none()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CDBError::AlreadyClosed.into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn read_into(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.backing.borrow_mut();
        match *guard {
            Some(ref mut backing) => backing.read_into(offset, buf),
            None => Err(CDBError::AlreadyClosed.into()),
        }
    }

    pub(crate) fn read_at(&self, offset: u32, len: usize) -> Result<Bytes> {
        let mut guard = self.backing.borrow_mut();
        match *guard {
            Some(ref mut backing) => backing.read_at(offset, len),
            None => Err(CDBError::AlreadyClosed.into()),
        }
    }

    fn read_pair(&self, offset: u32) -> Result<(u32, u32)> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok((unpack_u32_le(&buf[..4]), unpack_u32_le(&buf[4..])))
    }

    fn index_entry_at(&self, pos: IndexEntryPos) -> Result<IndexEntry> {
        let pos: usize = pos.into();
        assert!(pos >= MAIN_TABLE_SIZE_BYTES, "index entry inside the main table");

        let (hash, ptr) = self.read_pair(pos as u32)?;
        Ok(IndexEntry {
            hash: hash.into(),
            ptr,
        })
    }

    /// Reads a record header and range-checks the whole record against
    /// the file size before anything is allocated for it.
    pub(crate) fn record_head(&self, ptr: u32) -> Result<(u32, u32)> {
        let (klen, vlen) = self.read_pair(ptr)?;
        let record_end =
            ptr as u64 + RECORD_HEADER_SIZE as u64 + klen as u64 + vlen as u64;
        if record_end > self.size as u64 {
            let avail = (self.size as u64).saturating_sub(ptr as u64) as usize;
            return Err(CDBError::truncated(
                ptr as u64,
                (record_end - ptr as u64) as usize,
                avail,
            ).into());
        }
        Ok((klen, vlen))
    }

    /// Record pointers for `key` in probe order. Probe order equals
    /// addition order for files written by [`super::Writer`], so the
    /// first hit is the physically first record with that key.
    fn matches(&self, key: &[u8], all: bool) -> Result<Vec<u32>> {
        let hash = CDBHash::new(key);
        let bucket = self.table[hash.table()];
        let mut found = Vec::new();

        if bucket.num_ents == 0 {
            trace!("bucket empty, returning none");
            return Ok(found);
        }

        let slot = hash.slot(bucket.num_ents as usize);

        for x in 0..bucket.num_ents as usize {
            let entry_pos = bucket.entry_n_pos((x + slot) % bucket.num_ents as usize);
            let idx_ent = self.index_entry_at(entry_pos)?;

            if idx_ent.ptr == 0 {
                break;
            }
            if idx_ent.hash != hash {
                continue;
            }

            let (klen, _) = self.record_head(idx_ent.ptr)?;
            if klen as usize != key.len() {
                continue;
            }
            let stored = self.read_at(idx_ent.ptr + RECORD_HEADER_SIZE as u32, klen as usize)?;
            if &stored[..] == key {
                found.push(idx_ent.ptr);
                if !all {
                    break;
                }
            }
        }

        Ok(found)
    }

    pub(crate) fn first_ptr(&self, key: &[u8]) -> Result<Option<u32>> {
        Ok(self.matches(key, false)?.first().cloned())
    }

    fn value_at(&self, ptr: u32) -> Result<Bytes> {
        let (klen, vlen) = self.record_head(ptr)?;
        self.read_at(
            ptr + RECORD_HEADER_SIZE as u32 + klen,
            vlen as usize,
        )
    }

    // distinct keys, counted with the same first-offset filter the
    // iterators use; O(1) memory regardless of key volume
    fn count_distinct(&self) -> Result<usize> {
        let mut count = 0usize;
        let mut pos = MAIN_TABLE_SIZE_BYTES as u32;
        while pos < self.end {
            let (klen, vlen) = self.record_head(pos)?;
            let key = self.read_at(pos + RECORD_HEADER_SIZE as u32, klen as usize)?;
            if self.first_ptr(&key)? == Some(pos) {
                count += 1;
            }
            pos += RECORD_HEADER_SIZE as u32 + klen + vlen;
        }
        Ok(count)
    }
}

/// Read handle over a committed cdb file.
pub struct Reader {
    pub(crate) core: Rc<Core>,
}

impl Reader {
    /// Opens `source` with default [`Options`].
    pub fn open<S: Into<Source>>(source: S) -> Result<Reader> {
        Reader::open_with(source, Options::default())
    }

    /// Opens a path, raw descriptor or seekable stream.
    ///
    /// For descriptors, `opts.close` decides whether closing the reader
    /// closes the fd. `opts.mmap` picks the backing mode per its
    /// tri-state policy.
    pub fn open_with<S: Into<Source>>(source: S, opts: Options) -> Result<Reader> {
        let backing = match source.into() {
            Source::Path(path) => Backing::from_path(&path, opts.mmap)?,
            Source::Fd(fd) => Backing::from_fd(fd, opts.close.unwrap_or(false), opts.mmap)?,
            Source::Stream(stream) => Backing::from_stream(stream, opts.mmap)?,
        };
        Reader::from_backing(backing)
    }

    pub(crate) fn from_backing(mut backing: Backing) -> Result<Reader> {
        let size = check_u32(backing.size())?;

        let mut header = [0u8; MAIN_TABLE_SIZE_BYTES];
        backing.read_into(0, &mut header)?;

        let mut table = [Bucket::default(); MAIN_TABLE_SIZE];
        let mut end = size;
        for (i, chunk) in header.chunks(END_TABLE_ENTRY_SIZE).enumerate() {
            let ptr = unpack_u32_le(&chunk[..4]);
            let num_ents = unpack_u32_le(&chunk[4..]);
            if num_ents != 0 {
                let table_end =
                    ptr as u64 + END_TABLE_ENTRY_SIZE as u64 * num_ents as u64;
                if (ptr as usize) < MAIN_TABLE_SIZE_BYTES || table_end > size as u64 {
                    return Err(
                        CDBError::corrupt_header(i, ptr, num_ents, size).into()
                    );
                }
                end = cmp::min(end, ptr);
            }
            table[i] = Bucket { ptr, num_ents };
        }

        debug!("opened cdb: {} bytes, records end at {}", size, end);

        Ok(Reader {
            core: Rc::new(Core {
                backing: RefCell::new(Some(backing)),
                table,
                end,
                size,
                num_keys: Cell::new(None),
            }),
        })
    }

    /// First value stored under `key`, or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.ensure_open()?;
        match self.core.first_ptr(key)? {
            Some(ptr) => Ok(Some(self.core.value_at(ptr)?)),
            None => Ok(None),
        }
    }

    /// Every value stored under `key`, in addition order, or `None` if
    /// the key is absent entirely.
    pub fn get_all(&self, key: &[u8]) -> Result<Option<Vec<Bytes>>> {
        self.core.ensure_open()?;
        let ptrs = self.core.matches(key, true)?;
        if ptrs.is_empty() {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            values.push(self.core.value_at(ptr)?);
        }
        Ok(Some(values))
    }

    /// Like [`get`](Reader::get) but demands presence, failing with
    /// `KeyNotFound` (carrying the key) when absent.
    pub fn fetch(&self, key: &[u8]) -> Result<Bytes> {
        match self.get(key)? {
            Some(value) => Ok(value),
            None => Err(CDBError::key_not_found(key).into()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.core.ensure_open()?;
        Ok(self.core.first_ptr(key)?.is_some())
    }

    /// Number of distinct keys. Computed on first demand, cached after.
    pub fn num_keys(&self) -> Result<usize> {
        self.core.ensure_open()?;
        if let Some(n) = self.core.num_keys.get() {
            return Ok(n);
        }
        let n = self.core.count_distinct()?;
        self.core.num_keys.set(Some(n));
        Ok(n)
    }

    pub fn keys(&self, traverse: Traverse) -> Keys {
        Keys::new(&self.core, traverse)
    }

    pub fn values(&self, traverse: Traverse) -> Values {
        Values::new(&self.core, traverse)
    }

    pub fn items(&self, traverse: Traverse) -> Items {
        Items::new(&self.core, traverse)
    }

    pub fn fileno(&self) -> Result<RawFd> {
        let guard = self.core.backing.borrow();
        match *guard {
            Some(ref backing) => backing.fileno(),
            None => Err(CDBError::AlreadyClosed.into()),
        }
    }

    /// Releases the backing per its ownership flag. Idempotent; any
    /// iterator still alive fails with `AlreadyClosed` on its next step.
    pub fn close(&self) -> Result<()> {
        let taken = self.core.backing.borrow_mut().take();
        match taken {
            Some(mut backing) => backing.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Reader {{ size: {}, end: {}, closed: {} }}",
            self.core.size,
            self.core.end,
            self.core.is_closed()
        )
    }
}

impl<'a> IntoIterator for &'a Reader {
    type Item = Result<Bytes>;
    type IntoIter = Keys;

    fn into_iter(self) -> Keys {
        self.keys(Traverse::Distinct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdb::writer::Writer;
    use cdb::{SeekRead, Toggle};
    use libc;
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;
    use tempfile::NamedTempFile;

    fn build(pairs: &[(&[u8], &[u8])]) -> NamedTempFile {
        let mut ntf = NamedTempFile::new().unwrap();
        {
            let mut w = Writer::create_with(
                ntf.as_file().as_raw_fd(),
                Options::default(),
            ).unwrap();
            for &(k, v) in pairs {
                w.put(k, v).unwrap();
            }
            w.commit().unwrap();
        }
        ntf.seek(SeekFrom::Start(0)).unwrap();
        ntf
    }

    fn sample() -> NamedTempFile {
        build(&[
            (b"a", b"bc"),
            (b"def", b"ghij"),
            (b"def", b"klmno"),
            (b"a", b"xxy"),
            (b"b", b"sakdhgjksghf"),
        ])
    }

    #[test]
    fn lookup_first_and_all() {
        let ntf = sample();
        let cdb = Reader::open(ntf.path()).unwrap();

        assert_eq!(&cdb.get(b"a").unwrap().unwrap()[..], b"bc");
        assert_eq!(&cdb.get(b"def").unwrap().unwrap()[..], b"ghij");
        assert_eq!(&cdb.get(b"b").unwrap().unwrap()[..], b"sakdhgjksghf");
        assert!(cdb.get(b"c").unwrap().is_none());

        let all = cdb.get_all(b"def").unwrap().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(&all[0][..], b"ghij");
        assert_eq!(&all[1][..], b"klmno");

        let all = cdb.get_all(b"a").unwrap().unwrap();
        assert_eq!(&all[0][..], b"bc");
        assert_eq!(&all[1][..], b"xxy");
        assert!(cdb.get_all(b"c").unwrap().is_none());

        assert_eq!(cdb.num_keys().unwrap(), 3);
        // cached path
        assert_eq!(cdb.num_keys().unwrap(), 3);
    }

    #[test]
    fn fetch_missing_key_carries_the_key() {
        let ntf = sample();
        let cdb = Reader::open(ntf.path()).unwrap();

        assert!(cdb.contains(b"a").unwrap());
        assert!(!cdb.contains(b"c").unwrap());

        let err = cdb.fetch(b"c").unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::KeyNotFound { ref key }) => assert_eq!(&key[..], b"c"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn default_on_missing_key_is_callers_unwrap_or() {
        let ntf = sample();
        let cdb = Reader::open(ntf.path()).unwrap();
        let v = cdb.get(b"c").unwrap().unwrap_or_else(|| Bytes::from(&b"lla"[..]));
        assert_eq!(&v[..], b"lla");
    }

    #[test]
    fn closed_reader_fails_every_operation() {
        let ntf = sample();
        let cdb = Reader::open(ntf.path()).unwrap();
        cdb.close().unwrap();
        cdb.close().unwrap(); // noop

        fn assert_closed<T: ::std::fmt::Debug>(r: Result<T>) {
            match r.unwrap_err().downcast_ref::<CDBError>() {
                Some(&CDBError::AlreadyClosed) => (),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        assert_closed(cdb.get(b"a"));
        assert_closed(cdb.get_all(b"a"));
        assert_closed(cdb.fetch(b"a"));
        assert_closed(cdb.contains(b"a"));
        assert_closed(cdb.num_keys());
        assert_closed(cdb.fileno());
    }

    #[test]
    fn lookup_over_every_backing_mode() {
        let ntf = sample();

        for &mmap in &[Toggle::Default, Toggle::Enabled, Toggle::Disabled] {
            let cdb = Reader::open_with(
                ntf.path(),
                Options::new().mmap(mmap),
            ).unwrap();
            assert_eq!(&cdb.get(b"def").unwrap().unwrap()[..], b"ghij");
            assert_eq!(cdb.num_keys().unwrap(), 3);
        }

        let mut raw = Vec::new();
        let mut f = ntf.reopen().unwrap();
        f.read_to_end(&mut raw).unwrap();
        let stream: Box<dyn SeekRead> = Box::new(Cursor::new(raw));
        let cdb = Reader::open(stream).unwrap();
        assert_eq!(&cdb.get(b"a").unwrap().unwrap()[..], b"bc");
        assert_eq!(&cdb.get_all(b"def").unwrap().unwrap()[1][..], b"klmno");
    }

    #[test]
    fn fd_ownership_follows_the_close_option() {
        let ntf = sample();

        // close=Disabled leaves the descriptor alone
        let fd = unsafe { libc::dup(ntf.as_file().as_raw_fd()) };
        assert!(fd >= 0);
        let cdb = Reader::open_with(fd, Options::new().mmap(false)).unwrap();
        assert_eq!(cdb.fileno().unwrap(), fd);
        cdb.close().unwrap();
        assert_eq!(unsafe { libc::close(fd) }, 0);

        // close=Enabled takes it down with the reader
        let fd = unsafe { libc::dup(ntf.as_file().as_raw_fd()) };
        assert!(fd >= 0);
        let cdb = Reader::open_with(
            fd,
            Options::new().close(true).mmap(false),
        ).unwrap();
        cdb.close().unwrap();
        assert_eq!(unsafe { libc::close(fd) }, -1);
    }

    #[test]
    fn djb_style_empty_buckets_are_accepted() {
        // cdbmake writes (ptr=2048, nslots=0) for empty buckets instead
        // of zeros; both spellings describe the same empty table
        let mut ntf = NamedTempFile::new().unwrap();
        let mut header = Vec::with_capacity(MAIN_TABLE_SIZE_BYTES);
        for _ in 0..MAIN_TABLE_SIZE {
            header.extend_from_slice(&::cdb::pack_u32_le(2048));
            header.extend_from_slice(&::cdb::pack_u32_le(0));
        }
        ntf.write_all(&header).unwrap();

        let cdb = Reader::open(ntf.path()).unwrap();
        assert_eq!(cdb.num_keys().unwrap(), 0);
        assert!(cdb.get(b"anything").unwrap().is_none());
        assert!(cdb.keys(Traverse::All).next().is_none());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let mut ntf = NamedTempFile::new().unwrap();
        ntf.write_all(&[0u8; 100]).unwrap();
        let err = Reader::open(ntf.path()).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::Truncated { .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn header_pointing_outside_the_file_is_rejected() {
        let mut ntf = NamedTempFile::new().unwrap();
        let mut header = vec![0u8; MAIN_TABLE_SIZE_BYTES];
        // bucket 3 claims a huge subtable way past EOF
        header[24..28].copy_from_slice(&::cdb::pack_u32_le(4096));
        header[28..32].copy_from_slice(&::cdb::pack_u32_le(1000));
        ntf.write_all(&header).unwrap();
        let err = Reader::open(ntf.path()).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::CorruptHeader { bucket: 3, .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }

        // a subtable overlapping the header is just as corrupt
        let mut ntf = NamedTempFile::new().unwrap();
        let mut header = vec![0u8; MAIN_TABLE_SIZE_BYTES];
        header[0..4].copy_from_slice(&::cdb::pack_u32_le(100));
        header[4..8].copy_from_slice(&::cdb::pack_u32_le(1));
        ntf.write_all(&header).unwrap();
        let err = Reader::open(ntf.path()).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::CorruptHeader { bucket: 0, .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
