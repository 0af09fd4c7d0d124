extern crate cdbx_rs;

use std::io::{Read, Write};
use std::path::Path;

use cdbx_rs::cdb::input;
use cdbx_rs::{Reader, Result, Traverse, Writer};

/// Writes `count` random records as a terminated cdbmake stream.
pub fn gen<W: Write>(out: &mut W, count: usize) -> Result<()> {
    input::write_records(out, &input::random_records(count))
}

/// Builds `dest` from a cdbmake stream. Returns the record count.
pub fn make<R: Read>(inp: R, dest: &Path) -> Result<usize> {
    let mut w = Writer::create(dest)?;
    let mut count = 0;
    for record in input::Records::new(inp) {
        let record = record?;
        w.put(&record.k, &record.v)?;
        count += 1;
    }
    w.commit()?;
    Ok(count)
}

/// Dumps an existing cdb as a cdbmake stream. Returns the record count.
pub fn dump<W: Write>(src: &Path, out: &mut W) -> Result<usize> {
    let cdb = Reader::open(src)?;
    let mut count = 0;
    for item in cdb.items(Traverse::All) {
        let item = item?;
        input::write_record(out, &item.k, &item.v)?;
        count += 1;
    }
    input::finish(out)?;
    Ok(count)
}
