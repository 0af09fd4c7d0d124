//! The `cdbmake` record stream: `+klen,vlen:key->value\n` per record,
//! terminated by a single blank line. Used by the cdbgen tool and the
//! test fixtures.

use bytes::Bytes;
use rand::{self, Rng, RngCore};

use std::io::{self, Read, Write};

use cdb::errors::CDBError;
use cdb::{check_u32, Result, KV};

/// Writes one record in cdbmake format. The stream is only complete
/// once [`finish`] (or [`write_records`]) has added the blank line.
pub fn write_record<W: Write>(w: &mut W, key: &[u8], value: &[u8]) -> Result<()> {
    check_u32(key.len() as u64)?;
    check_u32(value.len() as u64)?;
    write!(w, "+{},{}:", key.len(), value.len())?;
    w.write_all(key)?;
    w.write_all(b"->")?;
    w.write_all(value)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// Terminates a record stream.
pub fn finish<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(b"\n")?;
    Ok(())
}

/// Writes a complete, terminated record stream.
pub fn write_records<'a, W, I>(w: &mut W, records: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a KV>,
{
    for kv in records {
        write_record(w, &kv.k, &kv.v)?;
    }
    finish(w)
}

/// Parses a cdbmake record stream. Wrap unbuffered inputs in a
/// `BufReader`; records are read byte-wise.
pub struct Records<R> {
    input: R,
    done: bool,
}

impl<R: Read> Records<R> {
    pub fn new(input: R) -> Records<R> {
        Records { input, done: false }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        match self.input.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(CDBError::invalid_record("unexpected end of input").into())
            }
            Err(err) => Err(err.into()),
        }
    }

    // ascii decimal up to the stop byte
    fn read_len(&mut self, stop: u8) -> Result<usize> {
        let mut n: u64 = 0;
        let mut digits = 0;
        loop {
            let b = self.read_byte()?;
            if b == stop {
                if digits == 0 {
                    return Err(CDBError::invalid_record("missing length").into());
                }
                check_u32(n)?;
                return Ok(n as usize);
            }
            if b < b'0' || b > b'9' {
                return Err(CDBError::invalid_record(format!(
                    "expected a digit, got {:#04x}",
                    b
                )).into());
            }
            n = n * 10 + u64::from(b - b'0');
            check_u32(n)?;
            digits += 1;
        }
    }

    fn expect(&mut self, lit: &[u8]) -> Result<()> {
        for &want in lit {
            let got = self.read_byte()?;
            if got != want {
                return Err(CDBError::invalid_record(format!(
                    "expected {:#04x}, got {:#04x}",
                    want, got
                )).into());
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self.input.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(CDBError::invalid_record("record data cut short").into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn next_record(&mut self) -> Result<Option<KV>> {
        match self.read_byte()? {
            b'\n' => {
                self.done = true;
                Ok(None)
            }
            b'+' => {
                let klen = self.read_len(b',')?;
                let vlen = self.read_len(b':')?;
                let key = self.read_exact(klen)?;
                self.expect(b"->")?;
                let value = self.read_exact(vlen)?;
                self.expect(b"\n")?;
                Ok(Some(KV {
                    k: Bytes::from(key),
                    v: Bytes::from(value),
                }))
            }
            b => Err(CDBError::invalid_record(format!(
                "record must start with '+', got {:#04x}",
                b
            )).into()),
        }
    }
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<KV>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(kv)) => Some(Ok(kv)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Uniformly random records shaped like the genrandom fixture
/// generator: key length in `0..256`, value length in `0..65536`.
pub fn random_records(count: usize) -> Vec<KV> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let klen: usize = rng.gen_range(0, 256);
            let vlen: usize = rng.gen_range(0, 65536);
            let mut k = vec![0u8; klen];
            rng.fill_bytes(&mut k);
            let mut v = vec![0u8; vlen];
            rng.fill_bytes(&mut v);
            KV {
                k: Bytes::from(k),
                v: Bytes::from(v),
            }
        })
        .collect()
}
