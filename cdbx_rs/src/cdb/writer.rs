use bytes::{BufMut, BytesMut};
use libc;
use tempfile::NamedTempFile;

use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use cdb::backing::Backing;
use cdb::errors::CDBError;
use cdb::reader::Reader;
use cdb::{
    check_u32, Bucket, CDBHash, IndexEntry, Options, Result, SeekReadWrite, Target,
    END_TABLE_ENTRY_SIZE, MAIN_TABLE_SIZE, MAIN_TABLE_SIZE_BYTES, RECORD_HEADER_SIZE,
};

fn ready_buf(size: usize) -> BytesMut {
    let mut b = BytesMut::with_capacity(size);
    b.reserve(size);
    b
}

// sequential writes on a caller-provided descriptor; closing is explicit
// so ownership can be handed to the reader on commit
struct FdWriter {
    fd: RawFd,
    owns: bool,
}

impl FdWriter {
    fn close(&mut self) -> Result<()> {
        if self.fd < 0 {
            return Ok(());
        }
        let fd = self.fd;
        self.fd = -1;
        if !self.owns {
            return Ok(());
        }
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let rv = unsafe {
                libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if rv < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rv as usize);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FdWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (whence, offset) = match pos {
            SeekFrom::Start(n) => (libc::SEEK_SET, n as libc::off_t),
            SeekFrom::End(n) => (libc::SEEK_END, n as libc::off_t),
            SeekFrom::Current(n) => (libc::SEEK_CUR, n as libc::off_t),
        };
        let rv = unsafe { libc::lseek(self.fd, offset, whence) };
        if rv < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rv as u64)
        }
    }
}

enum Sink {
    // path targets write into a sibling temp file and rename on commit,
    // so an aborted build never leaves a partial db at the destination
    Temp { file: NamedTempFile, dest: PathBuf },
    Fd(FdWriter),
    Stream(Box<dyn SeekReadWrite>),
}

impl Sink {
    fn fileno(&self) -> Result<RawFd> {
        match *self {
            Sink::Temp { ref file, .. } => Ok(file.as_file().as_raw_fd()),
            Sink::Fd(ref w) => Ok(w.fd),
            Sink::Stream(..) => Err(CDBError::not_supported("fileno").into()),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Sink::Temp { ref mut file, .. } => file.as_file_mut().write(buf),
            Sink::Fd(ref mut w) => w.write(buf),
            Sink::Stream(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Sink::Temp { ref mut file, .. } => file.as_file_mut().flush(),
            Sink::Fd(ref mut w) => w.flush(),
            Sink::Stream(ref mut s) => s.flush(),
        }
    }
}

impl Seek for Sink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match *self {
            Sink::Temp { ref mut file, .. } => file.as_file_mut().seek(pos),
            Sink::Fd(ref mut w) => w.seek(pos),
            Sink::Stream(ref mut s) => s.seek(pos),
        }
    }
}

/// Streams records into a work file and lays down the index on
/// [`commit`](Writer::commit). Append-only until committed; closing an
/// uncommitted path-target writer discards the partial file.
pub struct Writer {
    sink: Option<Sink>,
    index: Vec<Vec<IndexEntry>>,
    pos: u32,
    opts: Options,
}

impl Writer {
    /// Creates a builder for `target` with default [`Options`].
    pub fn create<T: Into<Target>>(target: T) -> Result<Writer> {
        Writer::create_with(target, Options::default())
    }

    /// Creates a builder writing to a path, raw descriptor or seekable
    /// stream. The `close` and `mmap` options also shape the [`Reader`]
    /// that [`commit`](Writer::commit) returns.
    pub fn create_with<T: Into<Target>>(target: T, opts: Options) -> Result<Writer> {
        let mut sink = match target.into() {
            Target::Path(dest) => {
                let dir = match dest.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                let file = NamedTempFile::new_in(&dir)?;
                Sink::Temp { file, dest }
            }
            Target::Fd(fd) => Sink::Fd(FdWriter {
                fd,
                owns: opts.close.unwrap_or(false),
            }),
            Target::Stream(stream) => Sink::Stream(stream),
        };

        // reserve the main table; it is rewritten on commit
        sink.seek(SeekFrom::Start(0))?;
        sink.write_all(&[0u8; MAIN_TABLE_SIZE_BYTES])?;

        Ok(Writer {
            sink: Some(sink),
            index: vec![Vec::new(); MAIN_TABLE_SIZE],
            pos: MAIN_TABLE_SIZE_BYTES as u32,
            opts,
        })
    }

    /// Appends one record. Duplicate keys are kept; lookups resolve to
    /// the first addition, `get_all` and all-mode iteration see every
    /// one in order.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let sink = match self.sink {
            Some(ref mut sink) => sink,
            None => return Err(CDBError::AlreadyClosed.into()),
        };

        let klen = check_u32(key.len() as u64)?;
        let vlen = check_u32(value.len() as u64)?;
        let record_size = RECORD_HEADER_SIZE as u64 + key.len() as u64 + value.len() as u64;
        let next = check_u32(self.pos as u64 + record_size)?;

        let mut buf = ready_buf(record_size as usize);
        buf.put_u32_le(klen);
        buf.put_u32_le(vlen);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        sink.write_all(&buf[..])?;

        let hash = CDBHash::new(key);
        self.index[hash.table()].push(IndexEntry {
            hash,
            ptr: self.pos,
        });
        self.pos = next;
        Ok(())
    }

    /// Writes the 256 index subtables and the main table, makes the file
    /// durable (path targets: fsync plus atomic rename over the
    /// destination), and reopens the result as a [`Reader`] honoring the
    /// original options.
    pub fn commit(mut self) -> Result<Reader> {
        let mut sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Err(CDBError::AlreadyClosed.into()),
        };

        let mut buckets: Vec<Bucket> = Vec::with_capacity(MAIN_TABLE_SIZE);
        let mut pos = self.pos;

        for tbl in &self.index {
            if tbl.is_empty() {
                // no subtable; the header slot stays all-zero
                buckets.push(Bucket {
                    ptr: 0,
                    num_ents: 0,
                });
                continue;
            }

            let length = tbl.len() << 1;
            let mut ordered: Vec<IndexEntry> = vec![IndexEntry::default(); length];
            for idx_ent in tbl {
                let slot = idx_ent.hash.slot(length);
                for i in 0..length {
                    let j = (i + slot) % length;
                    if ordered[j].ptr == 0 {
                        ordered[j] = *idx_ent;
                        break;
                    }
                }
            }

            let next = check_u32(pos as u64 + (length * END_TABLE_ENTRY_SIZE) as u64)?;
            let mut buf = ready_buf(length * END_TABLE_ENTRY_SIZE);
            for idx_ent in ordered {
                buf.put_u32_le(idx_ent.hash.inner());
                buf.put_u32_le(idx_ent.ptr);
            }
            sink.write_all(&buf[..])?;

            buckets.push(Bucket {
                ptr: pos,
                num_ents: length as u32,
            });
            pos = next;
        }

        // go back and fill in the main table
        sink.seek(SeekFrom::Start(0))?;
        {
            let mut buf = ready_buf(MAIN_TABLE_SIZE_BYTES);
            for bkt in &buckets {
                buf.put_u32_le(bkt.ptr);
                buf.put_u32_le(bkt.num_ents);
            }
            sink.write_all(&buf[..])?;
        }
        sink.flush()?;

        debug!("committed cdb: {} bytes", pos);

        match sink {
            Sink::Temp { file, dest } => {
                file.as_file().sync_all()?;
                let persisted = file.persist(&dest).map_err(|e| e.error)?;
                Reader::from_backing(Backing::from_file(persisted, self.opts.mmap)?)
            }
            Sink::Fd(w) => {
                Reader::from_backing(Backing::from_fd(w.fd, w.owns, self.opts.mmap)?)
            }
            Sink::Stream(mut stream) => {
                stream.seek(SeekFrom::Start(0))?;
                Reader::from_backing(Backing::from_stream(
                    Box::new(stream),
                    self.opts.mmap,
                )?)
            }
        }
    }

    pub fn fileno(&self) -> Result<RawFd> {
        match self.sink {
            Some(ref sink) => sink.fileno(),
            None => Err(CDBError::AlreadyClosed.into()),
        }
    }

    /// Aborts an uncommitted build. Path targets remove the work file;
    /// descriptor targets close the fd when `close` was enabled.
    /// Idempotent, and a no-op after [`commit`](Writer::commit).
    pub fn close(&mut self) -> Result<()> {
        match self.sink.take() {
            None => Ok(()),
            Some(sink) => match sink {
                Sink::Temp { file, .. } => file.close().map_err(|e| e.into()),
                Sink::Fd(mut w) => w.close(),
                Sink::Stream(stream) => {
                    drop(stream);
                    Ok(())
                }
            },
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.sink.is_some() {
            if let Err(err) = self.close() {
                warn!("error aborting cdb writer: {}", err);
            }
        }
    }
}
