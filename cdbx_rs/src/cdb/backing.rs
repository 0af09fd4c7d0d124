use bytes::Bytes;
use libc;
use memmap::Mmap;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::Path;

use cdb::errors::CDBError;
use cdb::{Result, SeekRead, Toggle};

/// A raw descriptor plus the ownership flag from the `close` option.
/// Reads are positional (`pread`) so the kernel file position is never
/// disturbed. `close()` only closes the descriptor when `owns` is set,
/// and is idempotent either way.
pub(crate) struct FdIo {
    fd: RawFd,
    owns: bool,
}

impl FdIo {
    pub(crate) fn new(fd: RawFd, owns: bool) -> FdIo {
        FdIo { fd, owns }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn size(&self) -> Result<u64> {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(st.st_size as u64)
    }

    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let rv = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as libc::off_t,
                )
            };
            if rv < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if rv == 0 {
                return Err(CDBError::truncated(offset, buf.len(), done).into());
            }
            done += rv as usize;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
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

impl Drop for FdIo {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("error closing cdb descriptor: {}", err);
        }
    }
}

// maps the file behind a descriptor we do not own; the fd is handed
// back via into_raw_fd so the temporary File never closes it
fn mmap_fd(fd: RawFd) -> Result<Mmap> {
    let f = unsafe { File::from_raw_fd(fd) };
    let rv = unsafe { Mmap::map(&f) };
    let _ = f.into_raw_fd();
    rv.map_err(|e| e.into())
}

/// Uniform byte-range reads over one of three modes: positional reads on
/// a descriptor, a read-only mapping of the whole file, or a caller
/// supplied seekable stream.
pub(crate) enum Backing {
    Fd { io: FdIo, size: u64 },
    Mmapped { map: Mmap, io: FdIo },
    Stream { stream: Box<dyn SeekRead>, size: u64 },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backing::Fd { size, .. } => f.debug_struct("Fd").field("size", size).finish(),
            Backing::Mmapped { .. } => f.debug_struct("Mmapped").finish(),
            Backing::Stream { size, .. } => {
                f.debug_struct("Stream").field("size", size).finish()
            }
        }
    }
}

impl Backing {
    pub(crate) fn from_path(path: &Path, mmap: Toggle) -> Result<Backing> {
        let f = File::open(path)?;
        Backing::from_file(f, mmap)
    }

    pub(crate) fn from_file(f: File, mmap: Toggle) -> Result<Backing> {
        Backing::from_fd(f.into_raw_fd(), true, mmap)
    }

    pub(crate) fn from_fd(fd: RawFd, owns: bool, mmap: Toggle) -> Result<Backing> {
        let io = FdIo::new(fd, owns);
        match mmap {
            Toggle::Enabled => {
                let map = mmap_fd(fd)?;
                Ok(Backing::Mmapped { map, io })
            }
            Toggle::Disabled => {
                let size = io.size()?;
                Ok(Backing::Fd { io, size })
            }
            Toggle::Default => match mmap_fd(fd) {
                Ok(map) => Ok(Backing::Mmapped { map, io }),
                Err(err) => {
                    debug!("mmap failed, falling back to pread: {}", err);
                    let size = io.size()?;
                    Ok(Backing::Fd { io, size })
                }
            },
        }
    }

    pub(crate) fn from_stream(mut stream: Box<dyn SeekRead>, mmap: Toggle) -> Result<Backing> {
        if mmap == Toggle::Enabled {
            return Err(CDBError::not_supported("mmap of a stream").into());
        }
        let size = stream.seek(SeekFrom::End(0))?;
        Ok(Backing::Stream { stream, size })
    }

    pub fn size(&self) -> u64 {
        match *self {
            Backing::Fd { size, .. } => size,
            Backing::Mmapped { ref map, .. } => map.len() as u64,
            Backing::Stream { size, .. } => size,
        }
    }

    pub fn fileno(&self) -> Result<RawFd> {
        match *self {
            Backing::Fd { ref io, .. } | Backing::Mmapped { ref io, .. } => Ok(io.fd()),
            Backing::Stream { .. } => Err(CDBError::not_supported("fileno").into()),
        }
    }

    /// Fills `buf` from `offset` or fails with `Truncated`.
    pub fn read_into(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        match *self {
            Backing::Fd { ref io, .. } => io.read_exact_at(offset as u64, buf),
            Backing::Mmapped { ref map, .. } => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > map.len() {
                    let got = map.len().saturating_sub(start);
                    return Err(CDBError::truncated(offset as u64, buf.len(), got).into());
                }
                buf.copy_from_slice(&map[start..end]);
                Ok(())
            }
            Backing::Stream {
                ref mut stream, ..
            } => {
                stream.seek(SeekFrom::Start(offset as u64))?;
                let mut done = 0usize;
                while done < buf.len() {
                    match stream.read(&mut buf[done..]) {
                        Ok(0) => {
                            return Err(
                                CDBError::truncated(offset as u64, buf.len(), done).into()
                            )
                        }
                        Ok(n) => done += n,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
        }
    }

    pub fn read_at(&mut self, offset: u32, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn close(&mut self) -> Result<()> {
        match *self {
            Backing::Fd { ref mut io, .. } | Backing::Mmapped { ref mut io, .. } => io.close(),
            // the stream is dropped with the backing; nothing to release early
            Backing::Stream { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::os::unix::io::AsRawFd;
    use tempfile::NamedTempFile;

    fn scratch(content: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.as_file().sync_all().unwrap();
        f
    }

    #[test]
    fn fd_positional_reads() {
        let f = scratch(b"hello, cdb");
        let mut b =
            Backing::from_fd(f.as_raw_fd(), false, Toggle::Disabled).unwrap();
        assert_eq!(b.size(), 10);
        assert_eq!(&b.read_at(7, 3).unwrap()[..], b"cdb");
        assert_eq!(&b.read_at(0, 5).unwrap()[..], b"hello");
    }

    #[test]
    fn fd_read_past_end_is_truncated() {
        let f = scratch(b"0123456789");
        let mut b =
            Backing::from_fd(f.as_raw_fd(), false, Toggle::Disabled).unwrap();
        let err = b.read_at(8, 4).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::Truncated { wanted: 4, got: 2, .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn mmap_reads() {
        let f = scratch(b"mapped bytes here");
        let mut b = Backing::from_fd(f.as_raw_fd(), false, Toggle::Enabled).unwrap();
        match b {
            Backing::Mmapped { .. } => (),
            _ => panic!("expected a mapping"),
        }
        assert_eq!(&b.read_at(7, 5).unwrap()[..], b"bytes");
        let err = b.read_at(15, 10).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::Truncated { .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn default_mode_prefers_mmap() {
        let f = scratch(b"pick a lane");
        let b = Backing::from_fd(f.as_raw_fd(), false, Toggle::Default).unwrap();
        match b {
            Backing::Mmapped { .. } => (),
            _ => panic!("expected the default policy to map"),
        }
    }

    #[test]
    fn stream_reads() {
        let cur = Cursor::new(b"stream me".to_vec());
        let mut b = Backing::from_stream(Box::new(cur), Toggle::Default).unwrap();
        assert_eq!(b.size(), 9);
        assert_eq!(&b.read_at(7, 2).unwrap()[..], b"me");
        assert_eq!(&b.read_at(0, 6).unwrap()[..], b"stream");
        match b.fileno().unwrap_err().downcast_ref::<CDBError>() {
            Some(&CDBError::NotSupported { .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn stream_refuses_forced_mmap() {
        let cur = Cursor::new(Vec::new());
        let err = Backing::from_stream(Box::new(cur), Toggle::Enabled).unwrap_err();
        match err.downcast_ref::<CDBError>() {
            Some(&CDBError::NotSupported { .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn close_honors_ownership() {
        let f = scratch(b"borrowed");
        let fd = f.as_raw_fd();
        let mut b = Backing::from_fd(fd, false, Toggle::Disabled).unwrap();
        b.close().unwrap();
        b.close().unwrap(); // idempotent
        // the descriptor is still usable because the backing did not own it
        let mut again = Backing::from_fd(fd, false, Toggle::Disabled).unwrap();
        assert_eq!(&again.read_at(0, 8).unwrap()[..], b"borrowed");
    }

    #[test]
    fn close_owned_fd_closes_descriptor() {
        let f = scratch(b"owned");
        let fd = unsafe { libc::dup(f.as_raw_fd()) };
        assert!(fd >= 0);
        let mut b = Backing::from_fd(fd, true, Toggle::Disabled).unwrap();
        b.close().unwrap();
        assert_eq!(unsafe { libc::close(fd) }, -1);
    }
}
