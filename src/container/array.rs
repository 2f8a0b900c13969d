//! Materialized array payloads and node attributes.

use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use half::f16;
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::util::{DataType, Endianness, Error, Result, ScalarKind};

/// Array shape, one extent per dimension. Scalars have an empty shape.
pub type Shape = SmallVec<[u64; 4]>;

/// Most elements a single array read will materialize.
pub const MAX_ELEMENTS: u64 = 1 << 30;

/// Number of elements described by a shape, failing on overflow.
pub fn shape_len(shape: &[u64]) -> Result<u64> {
    shape
        .iter()
        .try_fold(1u64, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| Error::malformed(format!("shape {shape:?} overflows the element count")))
}

/// Element count of a shape about to be materialized in memory.
///
/// Counts above [`MAX_ELEMENTS`] are rejected before anything is allocated.
pub fn element_count(shape: &[u64]) -> Result<usize> {
    let n = shape_len(shape)?;
    if n > MAX_ELEMENTS {
        return Err(Error::malformed(format!(
            "shape {shape:?} holds {n} elements, more than {MAX_ELEMENTS} can be read at once"
        )));
    }
    usize::try_from(n).map_err(|_| Error::malformed(format!("shape {shape:?} is too large")))
}

/// Decoded element values, widened to a handful of in-memory types.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayValues {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl ArrayValues {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::UInt(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// Check if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the value family, for error messages.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    /// Values `[start, end)` as a new array of the same family.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        match self {
            Self::Bool(v) => Self::Bool(v[start..end].to_vec()),
            Self::Int(v) => Self::Int(v[start..end].to_vec()),
            Self::UInt(v) => Self::UInt(v[start..end].to_vec()),
            Self::Float(v) => Self::Float(v[start..end].to_vec()),
            Self::Text(v) => Self::Text(v[start..end].to_vec()),
        }
    }

    /// An array of `n` copies of a fill value, in the family of `dtype`.
    pub fn filled(dtype: &DataType, fill: &Value, n: usize) -> Self {
        let kind = dtype.kind;
        if kind.is_text() {
            let s = fill.as_str().unwrap_or_default().to_string();
            Self::Text(vec![s; n])
        } else if kind == ScalarKind::Bool {
            Self::Bool(vec![fill.as_bool().unwrap_or(false); n])
        } else if kind.is_signed() {
            Self::Int(vec![fill.as_i64().unwrap_or(0); n])
        } else if kind.is_unsigned() {
            Self::UInt(vec![fill.as_u64().unwrap_or(0); n])
        } else {
            let f = match fill {
                Value::String(s) if s == "NaN" => f64::NAN,
                Value::String(s) if s == "Infinity" => f64::INFINITY,
                Value::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
                other => other.as_f64().unwrap_or(0.0),
            };
            Self::Float(vec![f; n])
        }
    }

    /// Empty array in the family of `dtype`.
    pub fn empty(dtype: &DataType) -> Self {
        Self::filled(dtype, &Value::Null, 0)
    }

    /// Append values of the same family.
    pub fn extend(&mut self, other: Self) -> Result<()> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.extend(b),
            (Self::Int(a), Self::Int(b)) => a.extend(b),
            (Self::UInt(a), Self::UInt(b)) => a.extend(b),
            (Self::Float(a), Self::Float(b)) => a.extend(b),
            (Self::Text(a), Self::Text(b)) => a.extend(b),
            (a, b) => return Err(Error::mismatch(a.family(), b.family())),
        }
        Ok(())
    }

    /// Copy element `src` of `other` into position `dst` of self.
    pub(crate) fn assign(&mut self, dst: usize, other: &Self, src: usize) -> Result<()> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a[dst] = b[src],
            (Self::Int(a), Self::Int(b)) => a[dst] = b[src],
            (Self::UInt(a), Self::UInt(b)) => a[dst] = b[src],
            (Self::Float(a), Self::Float(b)) => a[dst] = b[src],
            (Self::Text(a), Self::Text(b)) => a[dst] = b[src].clone(),
            (a, b) => return Err(Error::mismatch(a.family(), b.family())),
        }
        Ok(())
    }

    /// Decode `count` fixed-size elements from raw bytes.
    pub fn decode(dtype: &DataType, bytes: &[u8], count: usize) -> Result<Self> {
        let item = dtype
            .item_size()
            .ok_or_else(|| Error::malformed("object dtype has no fixed element size"))?;
        let expected = item.checked_mul(count);
        if expected != Some(bytes.len()) {
            return Err(Error::malformed(format!(
                "payload size {} doesn't match {} elements of {}",
                bytes.len(),
                count,
                dtype
            )));
        }

        match dtype.order {
            Endianness::Big => decode_fixed::<BigEndian>(dtype.kind, bytes, count),
            _ => decode_fixed::<LittleEndian>(dtype.kind, bytes, count),
        }
    }

    /// Decode strings stored as a JSON array.
    ///
    /// Accepts the numcodecs `json`/`json2` layout, which appends the dtype and
    /// shape after the items.
    pub fn decode_json_strings(bytes: &[u8], count: usize) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(format!("string payload is not JSON: {e}")))?;
        let Value::Array(mut items) = value else {
            return Err(Error::malformed("string payload is not a JSON array"));
        };
        if items.len() == count + 2 && items[count].is_string() && items[count + 1].is_array() {
            items.truncate(count);
        }
        if items.len() != count {
            return Err(Error::malformed(format!(
                "string payload holds {} items, expected {}",
                items.len(),
                count
            )));
        }
        let strings = items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        Ok(Self::Text(strings))
    }

    /// Decode numcodecs `vlen-utf8`: u32 count, then u32 length + bytes per item.
    pub fn decode_vlen_utf8(bytes: &[u8], count: usize) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let truncated = || Error::malformed("vlen-utf8 payload truncated");
        let n = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
        if n != count {
            return Err(Error::malformed(format!(
                "vlen-utf8 payload holds {n} items, expected {count}"
            )));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let len = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let start = cursor.position() as usize;
            let end = start.checked_add(len).filter(|&e| e <= bytes.len()).ok_or_else(truncated)?;
            let s = std::str::from_utf8(&bytes[start..end])
                .map_err(|e| Error::malformed(format!("vlen-utf8 item is not UTF-8: {e}")))?;
            out.push(s.to_string());
            cursor.set_position(end as u64);
        }
        Ok(Self::Text(out))
    }
}

fn decode_fixed<B: byteorder::ByteOrder>(
    kind: ScalarKind,
    bytes: &[u8],
    count: usize,
) -> Result<ArrayValues> {
    let mut rd = Cursor::new(bytes);
    // Length is validated by the caller, so reads below cannot run short.
    let values = match kind {
        ScalarKind::Bool => ArrayValues::Bool(bytes.iter().map(|&b| b != 0).collect()),
        ScalarKind::Int8 => ArrayValues::Int(bytes.iter().map(|&b| b as i8 as i64).collect()),
        ScalarKind::UInt8 => ArrayValues::UInt(bytes.iter().map(|&b| b as u64).collect()),
        ScalarKind::Int16 => ArrayValues::Int(read_n(count, || rd.read_i16::<B>().map(i64::from))?),
        ScalarKind::Int32 => ArrayValues::Int(read_n(count, || rd.read_i32::<B>().map(i64::from))?),
        ScalarKind::Int64 => ArrayValues::Int(read_n(count, || rd.read_i64::<B>())?),
        ScalarKind::UInt16 => ArrayValues::UInt(read_n(count, || rd.read_u16::<B>().map(u64::from))?),
        ScalarKind::UInt32 => ArrayValues::UInt(read_n(count, || rd.read_u32::<B>().map(u64::from))?),
        ScalarKind::UInt64 => ArrayValues::UInt(read_n(count, || rd.read_u64::<B>())?),
        ScalarKind::Float16 => ArrayValues::Float(read_n(count, || {
            rd.read_u16::<B>().map(|bits| f16::from_bits(bits).to_f64())
        })?),
        ScalarKind::Float32 => ArrayValues::Float(read_n(count, || rd.read_f32::<B>().map(f64::from))?),
        ScalarKind::Float64 => ArrayValues::Float(read_n(count, || rd.read_f64::<B>())?),
        ScalarKind::FixedBytes(n) => ArrayValues::Text(
            bytes
                .chunks_exact(n)
                .map(|raw| {
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    String::from_utf8_lossy(&raw[..end]).into_owned()
                })
                .collect(),
        ),
        ScalarKind::FixedUnicode(n) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                let mut s = String::with_capacity(n);
                for _ in 0..n {
                    let cp = rd.read_u32::<B>()?;
                    if cp == 0 {
                        continue;
                    }
                    let c = char::from_u32(cp)
                        .ok_or_else(|| Error::malformed(format!("invalid code point {cp:#x}")))?;
                    s.push(c);
                }
                out.push(s);
            }
            ArrayValues::Text(out)
        }
        ScalarKind::Object => {
            return Err(Error::malformed("object dtype has no fixed element size"));
        }
    };
    Ok(values)
}

fn read_n<T>(count: usize, mut f: impl FnMut() -> std::io::Result<T>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(f()?);
    }
    Ok(out)
}

/// A materialized array: element type, shape and decoded values in C order.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayData {
    pub dtype: DataType,
    pub shape: Shape,
    pub values: ArrayValues,
}

impl ArrayData {
    /// Create an array, checking that values fill the shape.
    pub fn new(dtype: DataType, shape: Shape, values: ArrayValues) -> Result<Self> {
        let expected = shape_len(&shape)?;
        if values.len() as u64 != expected {
            return Err(Error::malformed(format!(
                "array of shape {:?} holds {} values",
                shape.as_slice(),
                values.len()
            )));
        }
        Ok(Self { dtype, shape, values })
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Extent of the first dimension (1 for scalars).
    pub fn rows(&self) -> usize {
        self.shape.first().map_or(1, |&n| n as usize)
    }

    /// Borrow float values without conversion.
    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match &self.values {
            ArrayValues::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow string values.
    pub fn as_text(&self) -> Option<&[String]> {
        match &self.values {
            ArrayValues::Text(v) => Some(v),
            _ => None,
        }
    }

    /// All values converted to f64.
    pub fn to_f64(&self) -> Result<Vec<f64>> {
        match &self.values {
            ArrayValues::Float(v) => Ok(v.clone()),
            ArrayValues::Int(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ArrayValues::UInt(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ArrayValues::Bool(v) => Ok(v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect()),
            ArrayValues::Text(_) => Err(Error::mismatch("numeric array", "text array")),
        }
    }

    /// All values converted to i64. Floats must be integral.
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        match &self.values {
            ArrayValues::Int(v) => Ok(v.clone()),
            ArrayValues::UInt(v) => v
                .iter()
                .map(|&x| i64::try_from(x).map_err(|_| Error::mismatch("i64 range", x.to_string())))
                .collect(),
            ArrayValues::Bool(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            ArrayValues::Float(v) => v
                .iter()
                .map(|&x| {
                    if x.fract() == 0.0 && x.is_finite() {
                        Ok(x as i64)
                    } else {
                        Err(Error::mismatch("integral value", x.to_string()))
                    }
                })
                .collect(),
            ArrayValues::Text(_) => Err(Error::mismatch("integer array", "text array")),
        }
    }

    /// First element as a string, for scalar text datasets.
    pub fn scalar_text(&self) -> Option<&str> {
        self.as_text().and_then(|v| v.first()).map(String::as_str)
    }

    /// First element as f64, for scalar numeric datasets.
    pub fn scalar_f64(&self) -> Option<f64> {
        self.to_f64().ok().and_then(|v| v.first().copied())
    }
}

/// Attributes attached to a node: a JSON object of named values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attributes {
    map: Map<String, Value>,
}

impl Attributes {
    /// Create empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { map }
    }

    /// Build from any JSON value; non-objects are malformed.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            Value::Null => Ok(Self::default()),
            other => Err(Error::malformed(format!("attributes must be an object, got {other}"))),
        }
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// String attribute.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    /// Numeric attribute.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.map.get(key).and_then(Value::as_f64)
    }

    /// String list attribute. A single string counts as a one-element list.
    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        match self.map.get(key)? {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::String(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }

    /// Check if a key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Attribute names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    /// Iterate over name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smallvec::smallvec;

    #[test]
    fn test_decode_le_floats() {
        let mut bytes = Vec::new();
        for v in [0.1f64, 0.5, 1.2] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let values = ArrayValues::decode(&DataType::FLOAT64, &bytes, 3).unwrap();
        assert_eq!(values, ArrayValues::Float(vec![0.1, 0.5, 1.2]));
    }

    #[test]
    fn test_decode_big_endian_ints() {
        let dt = DataType::parse(">i4").unwrap();
        let bytes = [0u8, 0, 0, 7, 0xFF, 0xFF, 0xFF, 0xFE];
        let values = ArrayValues::decode(&dt, &bytes, 2).unwrap();
        assert_eq!(values, ArrayValues::Int(vec![7, -2]));
    }

    #[test]
    fn test_decode_half_and_fixed_strings() {
        let dt = DataType::parse("<f2").unwrap();
        let bytes = f16::from_f32(1.5).to_bits().to_le_bytes();
        assert_eq!(
            ArrayValues::decode(&dt, &bytes, 1).unwrap(),
            ArrayValues::Float(vec![1.5])
        );

        let dt = DataType::parse("|S4").unwrap();
        let values = ArrayValues::decode(&dt, b"ab\0\0wxyz", 2).unwrap();
        assert_eq!(values, ArrayValues::Text(vec!["ab".into(), "wxyz".into()]));
    }

    #[test]
    fn test_element_count_limits() {
        assert_eq!(shape_len(&[]).unwrap(), 1);
        assert_eq!(shape_len(&[3, 0, 5]).unwrap(), 0);
        assert_eq!(element_count(&[4, 5]).unwrap(), 20);

        let huge = [1u64 << 32, 1 << 32];
        assert!(matches!(shape_len(&huge), Err(Error::MalformedContainer(_))));
        assert!(matches!(element_count(&huge), Err(Error::MalformedContainer(_))));
        assert!(matches!(
            element_count(&[MAX_ELEMENTS + 1]),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_decode_size_mismatch() {
        let err = ArrayValues::decode(&DataType::FLOAT64, &[0u8; 7], 1).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer(_)));
    }

    #[test]
    fn test_json_strings_with_codec_trailer() {
        let bytes = br#"["left","right","|O",[2]]"#;
        let values = ArrayValues::decode_json_strings(bytes, 2).unwrap();
        assert_eq!(values, ArrayValues::Text(vec!["left".into(), "right".into()]));

        let err = ArrayValues::decode_json_strings(br#"["a"]"#, 2).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer(_)));
    }

    #[test]
    fn test_vlen_utf8() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        for s in ["go", "stop"] {
            bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
        let values = ArrayValues::decode_vlen_utf8(&bytes, 2).unwrap();
        assert_eq!(values, ArrayValues::Text(vec!["go".into(), "stop".into()]));

        assert!(ArrayValues::decode_vlen_utf8(&bytes[..bytes.len() - 1], 2).is_err());
    }

    #[test]
    fn test_array_conversions() {
        let arr = ArrayData::new(
            DataType::INT64,
            smallvec![3],
            ArrayValues::Int(vec![1, 2, 3]),
        )
        .unwrap();
        assert_eq!(arr.to_f64().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(arr.rows(), 3);

        let arr = ArrayData::new(DataType::FLOAT64, smallvec![2], ArrayValues::Float(vec![1.0, 2.5]))
            .unwrap();
        assert!(arr.to_i64().is_err());

        assert!(ArrayData::new(DataType::FLOAT64, smallvec![3], ArrayValues::Float(vec![1.0])).is_err());
    }

    #[test]
    fn test_attributes() {
        let attrs = Attributes::from_value(json!({
            "neurodata_type": "TimeIntervals",
            "colnames": ["start_time", "stop_time"],
            "rate": 30.0
        }))
        .unwrap();
        assert_eq!(attrs.get_str("neurodata_type"), Some("TimeIntervals"));
        assert_eq!(attrs.get_strings("colnames").unwrap().len(), 2);
        assert_eq!(attrs.get_f64("rate"), Some(30.0));
        assert!(Attributes::from_value(json!([1, 2])).is_err());
    }
}
