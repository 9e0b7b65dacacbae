/*
   Every frame starts with the same header. All integers are big-endian.

   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                          magic (32)                           |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |  opcode (8)   |            src node id (32) ...
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  | src ip (32) | src port (16) | dst node id (32) | dst ip (32)  |
  | dst port (16) | overlay id (32) | timeout id (64)             |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                 src nat descriptor (96)                       |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  | parent count (8) | parents: node id (32) ip (32) port (16) ... |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                      body (opcode specific)                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

   Strings carry a one-byte length (at most 255 bytes), booleans are one
   byte holding 0 or 1.
*/

mod address;
mod message;
mod opcode;

pub use address::{Address, VodAddress};
pub use message::{Body, Message};
pub use opcode::{
    ConnectStatus, EchoKind, KeepAliveStatus, Opcode, RegisterStatus, UnregisterStatus,
};

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use natpunch_core::nat::NatDescriptor;

pub const MAGIC: u32 = 0x4E50_4E54;

/// Bounds-checked cursor over a received frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(Error::decode(format!(
                "truncated: need {n} bytes, {} left",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::decode(format!("bool byte {v}"))),
        }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::decode(format!("string: {e}")))
    }

    pub(crate) fn nat(&mut self) -> Result<NatDescriptor> {
        NatDescriptor::decode(&mut self.buf).map_err(|e| Error::decode(e.to_string()))
    }

    pub(crate) fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::decode(format!("{} trailing bytes", self.buf.len())));
        }
        Ok(())
    }
}

pub(crate) fn put_string<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    let len = u8::try_from(s.len())
        .map_err(|_| Error::encode(format!("string of {} bytes exceeds 255", s.len())))?;
    buf.put_u8(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn put_bool<B: BufMut>(buf: &mut B, v: bool) {
    buf.put_u8(v as u8);
}
