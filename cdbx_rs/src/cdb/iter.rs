use bytes::Bytes;

use std::rc::{Rc, Weak};

use cdb::errors::CDBError;
use cdb::reader::Core;
use cdb::{Result, KV, MAIN_TABLE_SIZE_BYTES, RECORD_HEADER_SIZE};

/// How an iterator walks the records region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Traverse {
    /// At most one entry per unique key, at its first occurrence.
    Distinct,
    /// Every record, in file order (addition order for files built by
    /// [`super::Writer`]).
    All,
}

// Cursor over the records region, shared by the three iterator types.
// Holds a weak handle on the reader core: a failed upgrade means the
// reader was dropped, a closed core means it was closed. Neither check
// is fused, so the caller sees the failure on every subsequent step.
struct Walk {
    core: Weak<Core>,
    traverse: Traverse,
    pos: u32,
    end: u32,
    done: bool,
}

impl Walk {
    fn new(core: &Rc<Core>, traverse: Traverse) -> Walk {
        Walk {
            core: Rc::downgrade(core),
            traverse,
            pos: MAIN_TABLE_SIZE_BYTES as u32,
            end: core.end,
            done: false,
        }
    }

    fn step(&mut self, want_value: bool) -> Option<Result<(Bytes, Bytes)>> {
        if self.done {
            return None;
        }
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return Some(Err(CDBError::DanglingReference.into())),
        };
        if core.is_closed() {
            return Some(Err(CDBError::AlreadyClosed.into()));
        }
        loop {
            if self.pos >= self.end {
                self.done = true;
                return None;
            }
            match self.advance(&core, want_value) {
                Ok(Some(kv)) => return Some(Ok(kv)),
                // filtered out in distinct mode, keep walking
                Ok(None) => continue,
                Err(err) => {
                    // a record that cannot be read will not read better
                    // on the next call; park the cursor
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }

    fn advance(&mut self, core: &Core, want_value: bool) -> Result<Option<(Bytes, Bytes)>> {
        let pos = self.pos;
        let (klen, vlen) = core.record_head(pos)?;
        let next = pos + RECORD_HEADER_SIZE as u32 + klen + vlen;
        let key = core.read_at(pos + RECORD_HEADER_SIZE as u32, klen as usize)?;

        if self.traverse == Traverse::Distinct && core.first_ptr(&key)? != Some(pos) {
            self.pos = next;
            return Ok(None);
        }

        let value = if want_value {
            core.read_at(pos + RECORD_HEADER_SIZE as u32 + klen, vlen as usize)?
        } else {
            Bytes::new()
        };
        self.pos = next;
        Ok(Some((key, value)))
    }
}

pub struct Keys {
    walk: Walk,
}

impl Keys {
    pub(crate) fn new(core: &Rc<Core>, traverse: Traverse) -> Keys {
        Keys {
            walk: Walk::new(core, traverse),
        }
    }
}

impl Iterator for Keys {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.walk.step(false) {
            Some(Ok((k, _))) => Some(Ok(k)),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        }
    }
}

pub struct Values {
    walk: Walk,
}

impl Values {
    pub(crate) fn new(core: &Rc<Core>, traverse: Traverse) -> Values {
        Values {
            walk: Walk::new(core, traverse),
        }
    }
}

impl Iterator for Values {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.walk.step(true) {
            Some(Ok((_, v))) => Some(Ok(v)),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        }
    }
}

pub struct Items {
    walk: Walk,
}

impl Items {
    pub(crate) fn new(core: &Rc<Core>, traverse: Traverse) -> Items {
        Items {
            walk: Walk::new(core, traverse),
        }
    }
}

impl Iterator for Items {
    type Item = Result<KV>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.walk.step(true) {
            Some(Ok((k, v))) => Some(Ok(KV { k, v })),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        }
    }
}
