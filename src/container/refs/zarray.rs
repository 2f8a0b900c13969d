//! Zarr v2 array metadata (`.zarray`) and chunk geometry.

use serde::Deserialize;
use serde_json::Value;
use smallvec::SmallVec;

use crate::container::{chunk_grid, element_count, unshuffle, ArrayInfo, ArrayValues, Codec, Shape};
use crate::util::{DataType, Error, Result, ScalarKind};

/// String codec applied to object arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectCodec {
    /// numcodecs `json` / `json2`
    Json,
    /// numcodecs `vlen-utf8`
    VlenUtf8,
}

#[derive(Deserialize)]
struct RawZArray {
    #[serde(default)]
    zarr_format: Option<u8>,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: Value,
    #[serde(default)]
    fill_value: Value,
    #[serde(default = "default_order")]
    order: String,
    #[serde(default)]
    compressor: Option<Value>,
    #[serde(default)]
    filters: Option<Vec<Value>>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

fn default_order() -> String {
    "C".to_string()
}

/// Parsed `.zarray` document.
#[derive(Clone, Debug, PartialEq)]
pub struct ZArray {
    pub dtype: DataType,
    pub shape: Shape,
    pub chunks: Shape,
    pub fill_value: Value,
    pub compressor: Option<Codec>,
    pub object_codec: Option<ObjectCodec>,
    /// Element size of a numcodecs `shuffle` filter, undone after decompression.
    pub shuffle: Option<usize>,
    pub separator: char,
}

fn codec_id(v: &Value) -> Result<&str> {
    v.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed(format!("codec without an id: {v}")))
}

impl ZArray {
    /// Parse and validate a `.zarray` document.
    pub fn from_value(value: &Value) -> Result<Self> {
        let raw: RawZArray = serde_json::from_value(value.clone())
            .map_err(|e| Error::malformed(format!("invalid .zarray: {e}")))?;

        if raw.zarr_format.is_some_and(|f| f != 2) {
            return Err(Error::malformed(format!(
                "unsupported zarr_format {:?}",
                raw.zarr_format
            )));
        }
        let dtype = match &raw.dtype {
            Value::String(s) => DataType::parse(s)?,
            other => return Err(Error::malformed(format!("unsupported compound dtype {other}"))),
        };
        if raw.order != "C" {
            return Err(Error::malformed(format!("unsupported order {:?}", raw.order)));
        }
        if raw.shape.len() != raw.chunks.len() {
            return Err(Error::malformed(format!(
                "shape {:?} and chunks {:?} differ in rank",
                raw.shape, raw.chunks
            )));
        }
        if raw.chunks.contains(&0) {
            return Err(Error::malformed("zero-sized chunk dimension"));
        }

        let compressor = match &raw.compressor {
            None | Some(Value::Null) => None,
            Some(c) => Some(Codec::from_name(codec_id(c)?)?),
        };

        let mut object_codec = None;
        let mut shuffle = None;
        for filter in raw.filters.iter().flatten() {
            let codec = match codec_id(filter)? {
                "json" | "json2" => ObjectCodec::Json,
                "vlen-utf8" => ObjectCodec::VlenUtf8,
                "shuffle" => {
                    let size = match dtype.item_size() {
                        Some(size) if !dtype.kind.is_text() => size,
                        _ => {
                            return Err(Error::malformed(format!(
                                "shuffle filter on non-numeric dtype {dtype}"
                            )));
                        }
                    };
                    let element_size = match filter.get("elementsize") {
                        None | Some(Value::Null) => size,
                        Some(v) => v
                            .as_u64()
                            .and_then(|n| usize::try_from(n).ok())
                            .filter(|&n| n > 0)
                            .ok_or_else(|| {
                                Error::malformed(format!("invalid shuffle elementsize {v}"))
                            })?,
                    };
                    shuffle = Some(element_size);
                    continue;
                }
                other => return Err(Error::malformed(format!("unsupported filter {other:?}"))),
            };
            if dtype.kind != ScalarKind::Object {
                return Err(Error::malformed(format!(
                    "string filter on non-object dtype {dtype}"
                )));
            }
            object_codec = Some(codec);
        }
        if dtype.kind == ScalarKind::Object && object_codec.is_none() {
            return Err(Error::malformed("object array without a string codec"));
        }

        let separator = match raw.dimension_separator.as_deref() {
            None | Some(".") => '.',
            Some("/") => '/',
            Some(other) => {
                return Err(Error::malformed(format!("unsupported dimension separator {other:?}")));
            }
        };

        Ok(Self {
            dtype,
            shape: SmallVec::from_vec(raw.shape),
            chunks: SmallVec::from_vec(raw.chunks),
            fill_value: raw.fill_value,
            compressor,
            object_codec,
            shuffle,
            separator,
        })
    }

    /// Dtype, shape and codec for the view.
    pub fn info(&self) -> ArrayInfo {
        ArrayInfo {
            dtype: self.dtype,
            shape: self.shape.clone(),
            codec: self.compressor.map(|c| c.name().to_string()),
        }
    }

    /// Elements per chunk.
    pub fn chunk_len(&self) -> Result<usize> {
        element_count(&self.chunks)
    }

    /// Number of chunks along each dimension.
    pub fn grid(&self) -> Shape {
        chunk_grid(&self.shape, &self.chunks)
    }

    /// Chunk key suffix for a grid position; `0` for scalars.
    pub fn chunk_key(&self, index: &[u64]) -> String {
        if index.is_empty() {
            return "0".to_string();
        }
        let parts: Vec<String> = index.iter().map(u64::to_string).collect();
        parts.join(&self.separator.to_string())
    }

    /// Decode one stored chunk: decompress, undo the filters, then read the
    /// elements.
    pub fn decode_chunk(&self, raw: Vec<u8>) -> Result<ArrayValues> {
        let n = self.chunk_len()?;
        let mut bytes = match self.compressor {
            Some(codec) => codec.decode(&raw)?,
            None => raw,
        };
        if let Some(element_size) = self.shuffle {
            bytes = unshuffle(&bytes, element_size);
        }
        match self.object_codec {
            Some(ObjectCodec::Json) => ArrayValues::decode_json_strings(&bytes, n),
            Some(ObjectCodec::VlenUtf8) => ArrayValues::decode_vlen_utf8(&bytes, n),
            None => ArrayValues::decode(&self.dtype, &bytes, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> ZArray {
        ZArray::from_value(&v).unwrap()
    }

    #[test]
    fn test_parse() {
        let z = meta(json!({
            "zarr_format": 2, "shape": [10], "chunks": [4], "dtype": "<f8",
            "fill_value": "NaN", "order": "C", "compressor": {"id": "zlib", "level": 4},
            "filters": null
        }));
        assert_eq!(z.grid().as_slice(), &[3]);
        assert_eq!(z.compressor, Some(Codec::Zlib));
        assert_eq!(z.info().codec.as_deref(), Some("zlib"));

        let z = meta(json!({
            "shape": [2], "chunks": [2], "dtype": "|O",
            "filters": [{"id": "json2"}]
        }));
        assert_eq!(z.object_codec, Some(ObjectCodec::Json));
    }

    #[test]
    fn test_rejects_unsupported() {
        for v in [
            json!({"shape": [2], "chunks": [2], "dtype": "<f8", "order": "F"}),
            json!({"shape": [2], "chunks": [2], "dtype": "<f8", "compressor": {"id": "blosc"}}),
            json!({"shape": [2], "chunks": [2], "dtype": "|O"}),
            json!({"shape": [2], "chunks": [2], "dtype": [["a", "<f8"]]}),
            json!({"shape": [2], "chunks": [2, 1], "dtype": "<f8"}),
            json!({"shape": [2], "chunks": [2], "dtype": "<f8", "filters": [{"id": "delta"}]}),
            json!({"shape": [2], "chunks": [2], "dtype": "<c16"}),
        ] {
            assert!(matches!(ZArray::from_value(&v), Err(Error::MalformedContainer(_))), "{v}");
        }
    }

    #[test]
    fn test_chunk_keys() {
        let z = meta(json!({"shape": [4, 4], "chunks": [2, 2], "dtype": "<i4"}));
        assert_eq!(z.chunk_key(&[1, 0]), "1.0");
        let z = meta(json!({"shape": [4, 4], "chunks": [2, 2], "dtype": "<i4", "dimension_separator": "/"}));
        assert_eq!(z.chunk_key(&[1, 0]), "1/0");
        let z = meta(json!({"shape": [], "chunks": [], "dtype": "<i4"}));
        assert_eq!(z.chunk_key(&[]), "0");
    }

    #[test]
    fn test_shuffle_filter() {
        let z = meta(json!({
            "shape": [2], "chunks": [2], "dtype": "<u2",
            "compressor": {"id": "zlib", "level": 1},
            "filters": [{"id": "shuffle", "elementsize": 2}]
        }));
        assert_eq!(z.shuffle, Some(2));

        let raw = crate::container::shuffle(&[0x01, 0x02, 0x03, 0x04], 2);
        let stored = Codec::Zlib.encode(&raw).unwrap();
        assert_eq!(z.decode_chunk(stored).unwrap(), ArrayValues::UInt(vec![0x0201, 0x0403]));

        // elementsize defaults to the dtype's item size
        let z = meta(json!({
            "shape": [1], "chunks": [1], "dtype": "<f8", "filters": [{"id": "shuffle"}]
        }));
        assert_eq!(z.shuffle, Some(8));

        for v in [
            json!({"shape": [2], "chunks": [2], "dtype": "|O", "filters": [{"id": "shuffle"}]}),
            json!({"shape": [2], "chunks": [2], "dtype": "<f8",
                   "filters": [{"id": "shuffle", "elementsize": 0}]}),
        ] {
            assert!(matches!(ZArray::from_value(&v), Err(Error::MalformedContainer(_))), "{v}");
        }
    }
}
