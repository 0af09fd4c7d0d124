extern crate bytes;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate libc;
#[macro_use]
extern crate log;
extern crate memmap;
extern crate rand;
extern crate tempfile;

// dev dependencies
#[cfg(test)]
#[macro_use]
extern crate proptest;

pub use cdb::{
    pack_u32_le, unpack_u32_le, CDBError, Items, Keys, Options, Reader, Result, SeekRead,
    SeekReadWrite, Source, Target, Toggle, Traverse, Values, Writer, KV, STARTING_HASH,
};

pub mod cdb;
