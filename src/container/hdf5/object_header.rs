//! Object headers: the message lists that describe groups and datasets.
//!
//! Version 1 headers are a 16-byte prefix followed by 8-byte aligned
//! messages. Version 2 headers start with `OHDR`, carry a checksum, and put
//! continuation blocks behind an `OCHK` signature. Both may spill into any
//! number of continuation blocks, which are followed here eagerly.

use std::borrow::Cow;
use std::collections::HashSet;

use super::format::{verify_checksum, FileIo};
use super::messages::parse_shared;
use crate::util::{Error, Result};

pub const MSG_NIL: u16 = 0x0000;
pub const MSG_DATASPACE: u16 = 0x0001;
pub const MSG_LINK_INFO: u16 = 0x0002;
pub const MSG_DATATYPE: u16 = 0x0003;
pub const MSG_FILL_VALUE_OLD: u16 = 0x0004;
pub const MSG_FILL_VALUE: u16 = 0x0005;
pub const MSG_LINK: u16 = 0x0006;
pub const MSG_LAYOUT: u16 = 0x0008;
pub const MSG_GROUP_INFO: u16 = 0x000A;
pub const MSG_FILTER_PIPELINE: u16 = 0x000B;
pub const MSG_ATTRIBUTE: u16 = 0x000C;
pub const MSG_CONTINUATION: u16 = 0x0010;
pub const MSG_SYMBOL_TABLE: u16 = 0x0011;
pub const MSG_ATTRIBUTE_INFO: u16 = 0x0015;

/// Message flag: the body is a reference to a shared message.
pub const FLAG_SHARED: u8 = 0x02;

/// Guard against continuation cycles in corrupt files.
const MAX_CONTINUATIONS: usize = 4096;

/// One header message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: u16,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Message {
    /// True when the body points at a shared message elsewhere.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags & FLAG_SHARED != 0
    }
}

/// All messages of one object, in header order.
#[derive(Clone, Debug, Default)]
pub struct ObjectHeader {
    pub version: u8,
    pub messages: Vec<Message>,
}

impl ObjectHeader {
    /// Read the header at `addr` and every continuation block it names.
    pub fn read(io: &FileIo, addr: u64) -> Result<Self> {
        let head = io.read(addr, 4, "object header")?;
        if head == b"OHDR" {
            Self::read_v2(io, addr)
        } else {
            Self::read_v1(io, addr)
        }
    }

    /// First message of a kind.
    pub fn find(&self, kind: u16) -> Option<&Message> {
        self.messages.iter().find(|m| m.kind == kind)
    }

    /// Every message of a kind.
    pub fn all(&self, kind: u16) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.kind == kind)
    }

    /// Body of `msg`, following it to the header that holds it when shared.
    pub fn resolve<'a>(&self, io: &FileIo, msg: &'a Message) -> Result<Cow<'a, [u8]>> {
        if !msg.is_shared() {
            return Ok(Cow::Borrowed(&msg.data));
        }
        let addr = parse_shared(&msg.data, io.sizes())?;
        let target = Self::read(io, addr)?;
        target
            .find(msg.kind)
            .filter(|m| !m.is_shared())
            .map(|m| Cow::Owned(m.data.clone()))
            .ok_or_else(|| {
                Error::malformed(format!(
                    "shared message {:#x} not found in the header at {addr:#x}",
                    msg.kind
                ))
            })
    }

    /// Datasets carry a layout message; everything else is read as a group.
    pub fn is_dataset(&self) -> bool {
        self.find(MSG_LAYOUT).is_some()
    }

    fn read_v1(io: &FileIo, addr: u64) -> Result<Self> {
        let prefix = io.read(addr, 16, "object header")?;
        let mut f = io.fields(&prefix, "object header");
        let version = f.u8()?;
        if version != 1 {
            return Err(Error::malformed(format!(
                "object header at {addr:#x}: unsupported version {version}"
            )));
        }
        f.skip(1)?;
        let expected = f.u16()? as usize;
        f.skip(4)?; // reference count
        let size = f.u32()? as u64;

        let mut header = Self {
            version,
            messages: Vec::with_capacity(expected),
        };
        let mut blocks = vec![(addr + 16, size)];
        let mut seen = HashSet::new();
        while let Some((pos, len)) = blocks.pop() {
            if !seen.insert(pos) || seen.len() > MAX_CONTINUATIONS {
                return Err(Error::malformed(format!(
                    "object header at {addr:#x}: continuation loop"
                )));
            }
            let block = io.read(pos, len, "object header block")?;
            header.parse_v1_block(io, &block, &mut blocks)?;
        }
        Ok(header)
    }

    fn parse_v1_block(&mut self, io: &FileIo, block: &[u8], pending: &mut Vec<(u64, u64)>) -> Result<()> {
        let mut f = io.fields(block, "object header message");
        while f.remaining() >= 8 {
            let kind = f.u16()?;
            let size = f.u16()? as usize;
            let flags = f.u8()?;
            f.skip(3)?;
            let data = f.take(size)?;
            self.push(io, kind, flags, data, pending)?;
        }
        Ok(())
    }

    fn read_v2(io: &FileIo, addr: u64) -> Result<Self> {
        let head = io.read(addr, 6, "object header")?;
        let version = head[4];
        if version != 2 {
            return Err(Error::malformed(format!(
                "object header at {addr:#x}: unsupported version {version}"
            )));
        }
        let flags = head[5];
        let mut prefix_len = 6u64;
        if flags & 0x20 != 0 {
            prefix_len += 16; // access, modification, change, birth times
        }
        if flags & 0x10 != 0 {
            prefix_len += 4; // attribute phase change values
        }
        let size_width = 1u64 << (flags & 0x03);

        let prefix = io.read(addr, prefix_len + size_width, "object header")?;
        let mut f = io.fields(&prefix, "object header");
        f.skip(prefix_len as usize)?;
        let chunk0 = f.uint(size_width as usize)?;

        let total = prefix_len + size_width + chunk0 + 4;
        let block = io.read(addr, total, "object header")?;
        verify_checksum(&block, "object header")?;

        let creation_order = flags & 0x04 != 0;
        let mut header = Self {
            version,
            messages: Vec::new(),
        };
        let mut pending = Vec::new();
        let body_start = (prefix_len + size_width) as usize;
        header.parse_v2_block(io, &block[body_start..block.len() - 4], creation_order, &mut pending)?;

        let mut seen = HashSet::new();
        while let Some((pos, len)) = pending.pop() {
            if !seen.insert(pos) || seen.len() > MAX_CONTINUATIONS {
                return Err(Error::malformed(format!(
                    "object header at {addr:#x}: continuation loop"
                )));
            }
            let block = io.read(pos, len, "object header continuation")?;
            if block.len() < 8 || &block[..4] != b"OCHK" {
                return Err(Error::malformed(format!(
                    "continuation block at {pos:#x} has no OCHK signature"
                )));
            }
            verify_checksum(&block, "object header continuation")?;
            header.parse_v2_block(io, &block[4..block.len() - 4], creation_order, &mut pending)?;
        }
        Ok(header)
    }

    fn parse_v2_block(
        &mut self,
        io: &FileIo,
        body: &[u8],
        creation_order: bool,
        pending: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        let header_len = if creation_order { 6 } else { 4 };
        let mut f = io.fields(body, "object header message");
        // Anything shorter than a message header is a gap
        while f.remaining() >= header_len {
            let kind = f.u8()? as u16;
            let size = f.u16()? as usize;
            let flags = f.u8()?;
            if creation_order {
                f.skip(2)?;
            }
            let data = f.take(size)?;
            self.push(io, kind, flags, data, pending)?;
        }
        Ok(())
    }

    fn push(
        &mut self,
        io: &FileIo,
        kind: u16,
        flags: u8,
        data: &[u8],
        pending: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        match kind {
            MSG_NIL => {}
            MSG_CONTINUATION => {
                let mut f = io.fields(data, "continuation message");
                let pos = f
                    .address()?
                    .ok_or_else(|| Error::malformed("continuation to an undefined address"))?;
                let len = f.length()?;
                // Keep header order: blocks are popped from the back
                pending.insert(0, (pos, len));
            }
            _ => self.messages.push(Message {
                kind,
                flags,
                data: data.to_vec(),
            }),
        }
        Ok(())
    }
}
