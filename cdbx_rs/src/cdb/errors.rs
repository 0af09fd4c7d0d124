// for docs on the 'failure' crate see https://boats.gitlab.io/failure/intro.html

use bytes::Bytes;

#[derive(Debug, Fail)]
pub enum CDBError {
    #[fail(display = "key not found: {:?}", key)]
    KeyNotFound { key: Bytes },

    #[fail(display = "operation on a closed handle")]
    AlreadyClosed,

    #[fail(
        display = "corrupt header: bucket {} points at {:#010x} with {} slots, file size {}",
        bucket, ptr, num_ents, size
    )]
    CorruptHeader {
        bucket: usize,
        ptr: u32,
        num_ents: u32,
        size: u32,
    },

    #[fail(
        display = "truncated read at offset {}: wanted {} bytes, got {}",
        offset, wanted, got
    )]
    Truncated {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[fail(display = "value overflow: {} does not fit the 32-bit offset space", value)]
    Overflow { value: u64 },

    #[fail(display = "invalid record: {}", reason)]
    InvalidRecord { reason: String },

    #[fail(display = "reader was dropped while an iterator was still live")]
    DanglingReference,

    #[fail(display = "{} is not supported by this backing", operation)]
    NotSupported { operation: &'static str },
}

impl CDBError {
    pub fn key_not_found(key: &[u8]) -> CDBError {
        CDBError::KeyNotFound {
            key: Bytes::from(key),
        }
    }

    pub fn corrupt_header(bucket: usize, ptr: u32, num_ents: u32, size: u32) -> CDBError {
        CDBError::CorruptHeader {
            bucket,
            ptr,
            num_ents,
            size,
        }
    }

    pub fn truncated(offset: u64, wanted: usize, got: usize) -> CDBError {
        CDBError::Truncated {
            offset,
            wanted,
            got,
        }
    }

    pub fn overflow(value: u64) -> CDBError {
        CDBError::Overflow { value }
    }

    pub fn invalid_record<S: Into<String>>(reason: S) -> CDBError {
        CDBError::InvalidRecord {
            reason: reason.into(),
        }
    }

    pub fn not_supported(operation: &'static str) -> CDBError {
        CDBError::NotSupported { operation }
    }
}
