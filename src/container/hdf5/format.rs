//! HDF5 file-level constants, the superblock, and little-endian field access.
//!
//! Addresses and lengths in an HDF5 file have per-file widths declared in the
//! superblock. [`Fields`] reads them with those widths; [`FileIo`] turns file
//! addresses into bounded reads through the cached remote reader.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::remote::CachedReader;
use crate::util::{Error, Result};

/// File signature at the start of the superblock.
pub const HDF5_MAGIC: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// Largest user block skipped while searching for the superblock.
pub const MAX_USER_BLOCK: u64 = 1 << 20;

/// Bytes read to parse a superblock; covers every supported version.
const SUPERBLOCK_READ_LEN: u64 = 128;

/// Widths of file addresses ("offsets") and lengths, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sizes {
    pub offset: u8,
    pub length: u8,
}

impl Sizes {
    /// The 8/8 layout every modern writer uses.
    pub const DEFAULT: Sizes = Sizes { offset: 8, length: 8 };

    fn check(self) -> Result<Self> {
        for n in [self.offset, self.length] {
            if !matches!(n, 2 | 4 | 8) {
                return Err(Error::malformed(format!("unsupported address width {n}")));
            }
        }
        Ok(self)
    }
}

/// Number of bytes needed to encode `value` (at least 1).
pub fn encoded_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    (bits.saturating_sub(1) / 8) + 1
}

/// Little-endian reader over one parsed structure.
pub struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
    sizes: Sizes,
    what: &'static str,
}

impl<'a> Fields<'a> {
    /// Read `buf` as the structure named `what` (used in errors).
    pub fn new(buf: &'a [u8], sizes: Sizes, what: &'static str) -> Self {
        Self { buf, pos: 0, sizes, what }
    }

    /// Current position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Address and length widths in effect.
    #[inline]
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Take the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                Error::malformed(format!(
                    "{} truncated: need {n} bytes at {}, have {}",
                    self.what,
                    self.pos,
                    self.remaining()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Unsigned integer of `n` bytes (0..=8).
    pub fn uint(&mut self, n: usize) -> Result<u64> {
        if n > 8 {
            return Err(Error::malformed(format!("{}: {n}-byte integer", self.what)));
        }
        if n == 0 {
            return Ok(0);
        }
        Ok(LittleEndian::read_uint(self.take(n)?, n))
    }

    /// A file address; the all-ones value means "undefined".
    pub fn address(&mut self) -> Result<Option<u64>> {
        let n = self.sizes.offset as usize;
        let value = self.uint(n)?;
        let undefined = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        Ok((value != undefined).then_some(value))
    }

    /// A length field.
    pub fn length(&mut self) -> Result<u64> {
        self.uint(self.sizes.length as usize)
    }

    /// Expect a 4-byte signature.
    pub fn signature(&mut self, expected: &[u8; 4]) -> Result<()> {
        let found = self.take(4)?;
        if found != expected {
            return Err(Error::malformed(format!(
                "{}: expected signature {:?}, found {:?}",
                self.what,
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(found)
            )));
        }
        Ok(())
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Jenkins lookup3 `hashlittle`, the checksum of version 2 metadata.
pub fn checksum(data: &[u8]) -> u32 {
    lookup3(data, 0)
}

fn lookup3(data: &[u8], init: u32) -> u32 {
    let mut a = 0xdead_beef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(init);
    let mut b = a;
    let mut c = a;

    let word = |k: &[u8]| -> u32 {
        let mut buf = [0u8; 4];
        buf[..k.len()].copy_from_slice(k);
        u32::from_le_bytes(buf)
    };

    let mut k = data;
    while k.len() > 12 {
        a = a.wrapping_add(word(&k[0..4]));
        b = b.wrapping_add(word(&k[4..8]));
        c = c.wrapping_add(word(&k[8..12]));
        (a, b, c) = mix(a, b, c);
        k = &k[12..];
    }
    if k.is_empty() {
        return c;
    }

    let mut tail = [0u8; 12];
    tail[..k.len()].copy_from_slice(k);
    a = a.wrapping_add(word(&tail[0..4]));
    b = b.wrapping_add(word(&tail[4..8]));
    c = c.wrapping_add(word(&tail[8..12]));
    finish(a, b, c)
}

fn mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(c);
    a ^= c.rotate_left(4);
    c = c.wrapping_add(b);
    b = b.wrapping_sub(a);
    b ^= a.rotate_left(6);
    a = a.wrapping_add(c);
    c = c.wrapping_sub(b);
    c ^= b.rotate_left(8);
    b = b.wrapping_add(a);
    a = a.wrapping_sub(c);
    a ^= c.rotate_left(16);
    c = c.wrapping_add(b);
    b = b.wrapping_sub(a);
    b ^= a.rotate_left(19);
    a = a.wrapping_add(c);
    c = c.wrapping_sub(b);
    c ^= b.rotate_left(4);
    b = b.wrapping_add(a);
    (a, b, c)
}

fn finish(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}

/// Check the trailing 4-byte checksum of a metadata block.
pub fn verify_checksum(block: &[u8], what: &str) -> Result<()> {
    if block.len() < 4 {
        return Err(Error::malformed(format!("{what} too short for a checksum")));
    }
    let (body, stored) = block.split_at(block.len() - 4);
    let stored = LittleEndian::read_u32(stored);
    let computed = checksum(body);
    if stored != computed {
        return Err(Error::malformed(format!(
            "{what}: checksum {computed:#010x} does not match stored {stored:#010x}"
        )));
    }
    Ok(())
}

/// Parsed superblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub version: u8,
    pub sizes: Sizes,
    /// Absolute position every file address is relative to.
    pub base: u64,
    /// Object header address of the root group.
    pub root: u64,
}

impl Superblock {
    /// Parse a superblock found at absolute position `at`.
    pub fn parse(buf: &[u8], at: u64) -> Result<Self> {
        let mut f = Fields::new(buf, Sizes::DEFAULT, "superblock");
        if f.take(8)? != HDF5_MAGIC {
            return Err(Error::malformed("missing HDF5 signature"));
        }
        let version = f.u8()?;
        match version {
            0 | 1 => {
                f.skip(4)?; // free-space, root entry, reserved, shared header versions
                let sizes = Sizes {
                    offset: f.u8()?,
                    length: f.u8()?,
                }
                .check()?;
                f.skip(1)?;
                f.skip(2 + 2 + 4)?; // leaf K, internal K, consistency flags
                if version == 1 {
                    f.skip(4)?; // indexed storage K + reserved
                }
                let mut f = Fields::new(&buf[f.pos()..], sizes, "superblock");
                f.address()?; // base address
                f.address()?; // free-space info
                f.address()?; // end of file
                f.address()?; // driver info
                f.address()?; // root entry: link name offset
                let root = f
                    .address()?
                    .ok_or_else(|| Error::malformed("superblock has no root group"))?;
                Ok(Self {
                    version,
                    sizes,
                    base: at,
                    root,
                })
            }
            2 | 3 => {
                let sizes = Sizes {
                    offset: f.u8()?,
                    length: f.u8()?,
                }
                .check()?;
                f.skip(1)?; // consistency flags
                let start = f.pos();
                let mut g = Fields::new(&buf[start..], sizes, "superblock");
                g.address()?; // base address
                g.address()?; // superblock extension
                g.address()?; // end of file
                let root = g
                    .address()?
                    .ok_or_else(|| Error::malformed("superblock has no root group"))?;
                let end = start + g.pos() + 4;
                if buf.len() < end {
                    return Err(Error::malformed("superblock truncated"));
                }
                verify_checksum(&buf[..end], "superblock")?;
                Ok(Self {
                    version,
                    sizes,
                    base: at,
                    root,
                })
            }
            v => Err(Error::malformed(format!("unsupported superblock version {v}"))),
        }
    }
}

/// Bounded, address-translated reads of one HDF5 file.
pub struct FileIo {
    reader: Arc<CachedReader>,
    sizes: Sizes,
    base: u64,
    size: u64,
}

impl FileIo {
    /// Find the superblock and wrap the reader.
    pub fn open(reader: Arc<CachedReader>) -> Result<(Self, Superblock)> {
        let size = reader.len()?;
        let mut at = 0u64;
        loop {
            if at + HDF5_MAGIC.len() as u64 > size {
                return Err(Error::malformed(format!(
                    "{} is not an HDF5 file (no signature in {size} bytes)",
                    reader.resource()
                )));
            }
            if reader.read_at(at, HDF5_MAGIC.len() as u64)? == HDF5_MAGIC {
                break;
            }
            at = if at == 0 { 512 } else { at * 2 };
            if at > MAX_USER_BLOCK {
                return Err(Error::malformed(format!(
                    "{} is not an HDF5 file",
                    reader.resource()
                )));
            }
        }

        let head = reader.read_at(at, SUPERBLOCK_READ_LEN.min(size - at))?;
        let superblock = Superblock::parse(&head, at)?;
        let io = Self {
            reader,
            sizes: superblock.sizes,
            base: superblock.base,
            size,
        };
        Ok((io, superblock))
    }

    /// Address widths of this file.
    #[inline]
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Identity of the underlying resource.
    pub fn resource(&self) -> &str {
        self.reader.resource()
    }

    /// Read `len` bytes at file address `addr`, failing if the span leaves the file.
    pub fn read(&self, addr: u64, len: u64, what: &str) -> Result<Vec<u8>> {
        let start = self.base.checked_add(addr);
        match start.and_then(|s| s.checked_add(len)) {
            Some(end) if end <= self.size => self.reader.read_at(self.base + addr, len),
            _ => Err(Error::malformed(format!(
                "{what} at {addr:#x} (+{len}) lies outside the file ({} bytes)",
                self.size
            ))),
        }
    }

    /// Field reader over `buf` with this file's widths.
    pub fn fields<'a>(&self, buf: &'a [u8], what: &'static str) -> Fields<'a> {
        Fields::new(buf, self.sizes, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup3_vectors() {
        assert_eq!(lookup3(b"", 0), 0xdeadbeef);
        assert_eq!(lookup3(b"Four score and seven years ago", 0), 0x17770551);
        assert_eq!(lookup3(b"Four score and seven years ago", 1), 0xcd628161);
    }

    #[test]
    fn test_fields_widths() {
        let buf = [0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0x10, 0x00, 0x00, 0x00];
        let mut f = Fields::new(&buf, Sizes { offset: 4, length: 2 }, "test");
        assert_eq!(f.length().unwrap(), 0x0201);
        assert_eq!(f.address().unwrap(), None);
        assert_eq!(f.address().unwrap(), Some(0x10));
        assert!(matches!(f.u8(), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_encoded_size() {
        assert_eq!(encoded_size(0), 1);
        assert_eq!(encoded_size(255), 1);
        assert_eq!(encoded_size(256), 2);
        assert_eq!(encoded_size(65536), 3);
    }

    #[test]
    fn test_superblock_rejects() {
        assert!(Superblock::parse(b"\x89HDF\r", 0).is_err());
        let mut buf = HDF5_MAGIC.to_vec();
        buf.push(9);
        buf.resize(64, 0);
        assert!(matches!(Superblock::parse(&buf, 0), Err(Error::MalformedContainer(_))));
    }
}
