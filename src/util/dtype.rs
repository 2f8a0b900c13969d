//! Element data types, described by numpy-style type strings.
//!
//! Both container layouts describe arrays with the same type strings that
//! Zarr and HDF5-to-Zarr translators emit: a byte-order character followed by
//! a kind character and an item size, e.g. `<f8`, `|u1`, `|S12`, `|O`.

use std::fmt;

use super::{Error, Result};

/// Byte order of multi-byte elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endianness {
    #[default]
    Little,
    Big,
    /// Single-byte or non-numeric elements (`|`).
    NotApplicable,
}

impl Endianness {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '<' => Some(Self::Little),
            '>' => Some(Self::Big),
            '|' => Some(Self::NotApplicable),
            // Native order; every supported target is little-endian.
            '=' => Some(Self::Little),
            _ => None,
        }
    }

    const fn as_char(self) -> char {
        match self {
            Self::Little => '<',
            Self::Big => '>',
            Self::NotApplicable => '|',
        }
    }
}

/// Kind of a single element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    /// Fixed-width byte string, NUL padded (`S<n>`).
    FixedBytes(usize),
    /// Fixed-width UTF-32 string (`U<n>`, n code points).
    FixedUnicode(usize),
    /// Variable-length object, in practice always a string (`O`).
    Object,
}

impl ScalarKind {
    /// Size in bytes of one stored element, or `None` for variable-length
    /// objects and widths that overflow `usize`.
    pub const fn item_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 | Self::Float16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::FixedBytes(n) => Some(n),
            Self::FixedUnicode(n) => n.checked_mul(4),
            Self::Object => None,
        }
    }

    /// Returns true for signed integer kinds.
    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// Returns true for unsigned integer kinds.
    #[inline]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    /// Returns true for floating point kinds.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    /// Returns true for any string kind.
    #[inline]
    pub const fn is_text(self) -> bool {
        matches!(self, Self::FixedBytes(_) | Self::FixedUnicode(_) | Self::Object)
    }
}

/// Element type of an array: kind plus byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataType {
    pub kind: ScalarKind,
    pub order: Endianness,
}

impl DataType {
    /// Create a new DataType.
    #[inline]
    pub const fn new(kind: ScalarKind, order: Endianness) -> Self {
        Self { kind, order }
    }

    pub const BOOL: Self = Self::new(ScalarKind::Bool, Endianness::NotApplicable);
    pub const INT32: Self = Self::new(ScalarKind::Int32, Endianness::Little);
    pub const INT64: Self = Self::new(ScalarKind::Int64, Endianness::Little);
    pub const UINT8: Self = Self::new(ScalarKind::UInt8, Endianness::NotApplicable);
    pub const UINT64: Self = Self::new(ScalarKind::UInt64, Endianness::Little);
    pub const FLOAT32: Self = Self::new(ScalarKind::Float32, Endianness::Little);
    pub const FLOAT64: Self = Self::new(ScalarKind::Float64, Endianness::Little);
    pub const OBJECT: Self = Self::new(ScalarKind::Object, Endianness::NotApplicable);

    /// Parse a numpy type string such as `<f8` or `|S10`.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::malformed(format!("unsupported dtype {s:?}"));

        let mut chars = s.chars();
        let first = chars.next().ok_or_else(bad)?;
        let (order, rest) = match Endianness::from_char(first) {
            Some(order) => (order, &s[1..]),
            None => (Endianness::NotApplicable, s),
        };

        let mut rest_chars = rest.chars();
        let kind_char = rest_chars.next().ok_or_else(bad)?;
        let size_str = rest_chars.as_str();
        let size = if size_str.is_empty() {
            None
        } else {
            Some(size_str.parse::<usize>().map_err(|_| bad())?)
        };

        let kind = match (kind_char, size) {
            ('b', Some(1)) | ('?', None) => ScalarKind::Bool,
            ('i', Some(1)) => ScalarKind::Int8,
            ('i', Some(2)) => ScalarKind::Int16,
            ('i', Some(4)) => ScalarKind::Int32,
            ('i', Some(8)) => ScalarKind::Int64,
            ('u', Some(1)) => ScalarKind::UInt8,
            ('u', Some(2)) => ScalarKind::UInt16,
            ('u', Some(4)) => ScalarKind::UInt32,
            ('u', Some(8)) => ScalarKind::UInt64,
            ('f', Some(2)) => ScalarKind::Float16,
            ('f', Some(4)) => ScalarKind::Float32,
            ('f', Some(8)) => ScalarKind::Float64,
            ('S', Some(n)) if n > 0 => ScalarKind::FixedBytes(n),
            ('U', Some(n)) if n > 0 && n.checked_mul(4).is_some() => ScalarKind::FixedUnicode(n),
            ('O', None) => ScalarKind::Object,
            _ => return Err(bad()),
        };

        // Single-byte kinds carry no byte order regardless of the prefix.
        let order = match kind.item_size() {
            Some(1) | None => Endianness::NotApplicable,
            _ if matches!(kind, ScalarKind::FixedBytes(_)) => Endianness::NotApplicable,
            _ if order == Endianness::NotApplicable => Endianness::Little,
            _ => order,
        };

        Ok(Self { kind, order })
    }

    /// Size of one stored element in bytes (`None` for objects).
    #[inline]
    pub const fn item_size(&self) -> Option<usize> {
        self.kind.item_size()
    }

    /// The numpy type string for this type.
    pub fn typestr(&self) -> String {
        let o = self.order.as_char();
        match self.kind {
            ScalarKind::Bool => "|b1".to_string(),
            ScalarKind::Int8 => "|i1".to_string(),
            ScalarKind::UInt8 => "|u1".to_string(),
            ScalarKind::Int16 => format!("{o}i2"),
            ScalarKind::Int32 => format!("{o}i4"),
            ScalarKind::Int64 => format!("{o}i8"),
            ScalarKind::UInt16 => format!("{o}u2"),
            ScalarKind::UInt32 => format!("{o}u4"),
            ScalarKind::UInt64 => format!("{o}u8"),
            ScalarKind::Float16 => format!("{o}f2"),
            ScalarKind::Float32 => format!("{o}f4"),
            ScalarKind::Float64 => format!("{o}f8"),
            ScalarKind::FixedBytes(n) => format!("|S{n}"),
            ScalarKind::FixedUnicode(n) => format!("{o}U{n}"),
            ScalarKind::Object => "|O".to_string(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typestr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        let dt = DataType::parse("<f8").unwrap();
        assert_eq!(dt, DataType::FLOAT64);
        assert_eq!(dt.item_size(), Some(8));

        let dt = DataType::parse(">i4").unwrap();
        assert_eq!(dt.kind, ScalarKind::Int32);
        assert_eq!(dt.order, Endianness::Big);

        assert_eq!(DataType::parse("|u1").unwrap(), DataType::UINT8);
        assert_eq!(DataType::parse("|b1").unwrap(), DataType::BOOL);
        assert_eq!(DataType::parse("<f2").unwrap().kind, ScalarKind::Float16);
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(DataType::parse("|O").unwrap(), DataType::OBJECT);
        assert_eq!(DataType::parse("|S5").unwrap().item_size(), Some(5));
        assert_eq!(DataType::parse("<U3").unwrap().item_size(), Some(12));
        assert!(DataType::parse("|S5").unwrap().kind.is_text());
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let huge = format!("<U{}", usize::MAX / 2);
        for s in ["", "<", "<f3", "<c16", "|S0", "garbage", huge.as_str()] {
            let err = DataType::parse(s).unwrap_err();
            assert!(matches!(err, Error::MalformedContainer(_)), "{s}");
        }
    }

    #[test]
    fn test_typestr_roundtrip() {
        for s in ["<f8", ">i2", "|u1", "|b1", "|S7", "|O", "<u8"] {
            assert_eq!(DataType::parse(s).unwrap().typestr(), s);
        }
    }
}
