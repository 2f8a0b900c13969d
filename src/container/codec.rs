//! Payload compression shared by the container backends.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::util::{Error, Result};

/// Compression applied to a stored payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Zlib,
    Gzip,
}

impl Codec {
    /// Codec by its stored name (`zlib`, `gzip`).
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "zlib" => Ok(Self::Zlib),
            "gzip" => Ok(Self::Gzip),
            other => Err(Error::malformed(format!("unsupported compressor {other:?}"))),
        }
    }

    /// Stored name of the codec.
    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Gzip => "gzip",
        }
    }

    /// Decompress a payload.
    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let res = match self {
            Self::Zlib => ZlibDecoder::new(data).read_to_end(&mut out),
            Self::Gzip => GzDecoder::new(data).read_to_end(&mut out),
        };
        res.map_err(|e| Error::malformed(format!("{} payload is corrupt: {e}", self.name())))?;
        Ok(out)
    }

    /// Compress a payload at the default level.
    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

/// Undo a byte shuffle: the input holds byte 0 of every element, then byte 1,
/// and so on. Trailing bytes that don't fill an element are kept in place.
pub fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 || data.len() < element_size {
        return data.to_vec();
    }
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for byte in 0..element_size {
        let plane = &data[byte * count..(byte + 1) * count];
        for (i, &b) in plane.iter().enumerate() {
            out[i * element_size + byte] = b;
        }
    }
    let body = count * element_size;
    out[body..].copy_from_slice(&data[body..]);
    out
}

/// Byte shuffle, the inverse of [`unshuffle`].
pub fn shuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 || data.len() < element_size {
        return data.to_vec();
    }
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(element_size).enumerate() {
        for (byte, &b) in element.iter().enumerate() {
            out[byte * count + i] = b;
        }
    }
    let body = count * element_size;
    out[body..].copy_from_slice(&data[body..]);
    out
}
