//! Reference manifest parsing (LINDI JSON / kerchunk reference file system).

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use crate::util::{Error, Result};

/// Prefix marking binary inline values.
pub const BASE64_PREFIX: &str = "base64:";

/// Where the bytes of one key live.
#[derive(Clone, Debug, PartialEq)]
pub enum RefValue {
    /// Inline JSON document (metadata keys).
    Json(Value),
    /// Inline bytes: plain text or decoded `base64:` payload.
    Inline(Vec<u8>),
    /// A whole remote object.
    Whole { url: String },
    /// `size` bytes at `offset` of a remote object.
    Range { url: String, offset: u64, size: u64 },
}

/// Parsed reference manifest: key -> value, templates already expanded.
#[derive(Clone, Debug, Default)]
pub struct ReferenceManifest {
    refs: BTreeMap<String, RefValue>,
}

impl ReferenceManifest {
    /// Parse manifest bytes.
    ///
    /// Accepts `{"refs": {...}, "templates"?: {...}}` and the older flat
    /// layout where the top-level object is the reference map.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(format!("reference manifest is not JSON: {e}")))?;
        let Value::Object(mut top) = doc else {
            return Err(Error::malformed("reference manifest is not a JSON object"));
        };

        if top
            .remove("gen")
            .is_some_and(|g| g.as_array().is_some_and(|a| !a.is_empty()))
        {
            return Err(Error::malformed("generated references are not supported"));
        }

        let templates = match top.remove("templates") {
            Some(Value::Object(t)) => t,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(Error::malformed("\"templates\" must be an object")),
        };
        let raw = match top.remove("refs") {
            Some(Value::Object(r)) => r,
            Some(_) => return Err(Error::malformed("\"refs\" must be an object")),
            None => {
                top.remove("version");
                top
            }
        };

        let mut refs = BTreeMap::new();
        for (key, value) in raw {
            let parsed = parse_value(&key, value, &templates)?;
            refs.insert(key, parsed);
        }
        Ok(Self { refs })
    }

    /// Value of a key.
    pub fn get(&self, key: &str) -> Option<&RefValue> {
        self.refs.get(key)
    }

    /// Check if a key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.refs.contains_key(key)
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().map(String::as_str)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Check if the manifest has no keys.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

fn parse_value(key: &str, value: Value, templates: &Map<String, Value>) -> Result<RefValue> {
    let bad = |what: &str| Error::malformed(format!("reference {key:?}: {what}"));
    match value {
        Value::Object(_) => Ok(RefValue::Json(value)),
        Value::String(s) => match s.strip_prefix(BASE64_PREFIX) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(RefValue::Inline)
                .map_err(|e| bad(&format!("invalid base64: {e}"))),
            None => Ok(RefValue::Inline(s.into_bytes())),
        },
        Value::Array(items) => {
            let url = items
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| bad("first element must be a URL"))?;
            let url = expand_templates(url, templates).map_err(|e| bad(&e))?;
            match items.len() {
                1 => Ok(RefValue::Whole { url }),
                3 => {
                    let offset = items[1].as_u64().ok_or_else(|| bad("offset must be an integer"))?;
                    let size = items[2].as_u64().ok_or_else(|| bad("size must be an integer"))?;
                    Ok(RefValue::Range { url, offset, size })
                }
                n => Err(bad(&format!("expected [url] or [url, offset, size], got {n} items"))),
            }
        }
        other => Err(bad(&format!("unsupported value {other}"))),
    }
}

/// Replace `{{name}}` placeholders with template values.
fn expand_templates(url: &str, templates: &Map<String, Value>) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated template in {url:?}"))?;
        let name = after[..end].trim();
        let value = templates
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("unknown template {name:?}"))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
