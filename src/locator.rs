//! Locator resolution: decide how a dataset identifier is loaded.
//!
//! Classification is purely syntactic; no I/O happens here.
//!
//! | Locator                                         | Strategy    |
//! |-------------------------------------------------|-------------|
//! | `…/nwb.lindi.json`, `x.lindi` (URL or path)     | `Reference` |
//! | `https://host/object`, `file:///abs/path`       | `Direct`    |
//! | `s3://bucket/key` (rewritten to HTTPS)          | `Direct`    |
//! | anything else                                   | error       |

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::util::{Error, Result};

/// Suffixes that mark a reference descriptor (LINDI JSON manifest).
pub const REFERENCE_SUFFIXES: &[&str] = &[".lindi.json", ".lindi"];

/// Loading strategy selected for a locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// JSON manifest mapping container keys to inline values or byte ranges.
    Reference,
    /// Raw byte-range reads against a single object.
    Direct,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Where the bytes behind a locator live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Remote (http/https) or `file://` URL.
    Url(Url),
    /// Bare local filesystem path.
    Path(PathBuf),
}

/// A classified dataset locator. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    strategy: Strategy,
    target: Target,
}

impl Locator {
    /// Classify a dataset identifier.
    pub fn resolve(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let unrecognized = || Error::UnrecognizedLocator(raw.to_string());
        if trimmed.is_empty() {
            return Err(unrecognized());
        }

        let (strategy, target) = if has_scheme(trimmed) {
            let mut url = Url::parse(trimmed).map_err(|_| unrecognized())?;
            match url.scheme() {
                "http" | "https" => {
                    if url.host_str().map_or(true, str::is_empty) {
                        return Err(unrecognized());
                    }
                }
                "file" => {
                    if url.path().is_empty() || url.path() == "/" {
                        return Err(unrecognized());
                    }
                }
                "s3" => {
                    url = s3_to_https(&url).ok_or_else(unrecognized)?;
                }
                _ => return Err(unrecognized()),
            }
            let strategy = if is_reference_path(url.path()) {
                Strategy::Reference
            } else {
                Strategy::Direct
            };
            (strategy, Target::Url(url))
        } else if is_reference_path(trimmed) {
            (Strategy::Reference, Target::Path(PathBuf::from(trimmed)))
        } else {
            return Err(unrecognized());
        };

        Ok(Self {
            raw: raw.to_string(),
            strategy,
            target,
        })
    }

    /// The identifier as given.
    #[inline]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Selected loading strategy.
    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Where the bytes live.
    #[inline]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Local path, for `file://` URLs and bare paths.
    pub fn local_path(&self) -> Option<PathBuf> {
        match &self.target {
            Target::Path(p) => Some(p.clone()),
            Target::Url(u) if u.scheme() == "file" => u.to_file_path().ok(),
            Target::Url(_) => None,
        }
    }

    /// Stable identity of the resource, used as the cache key.
    pub fn resource_id(&self) -> String {
        match &self.target {
            Target::Url(u) => u.to_string(),
            Target::Path(p) => {
                let abs = absolute(p);
                Url::from_file_path(&abs)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| format!("file://{}", abs.display()))
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.raw, self.strategy)
    }
}

fn has_scheme(s: &str) -> bool {
    match s.find("://") {
        Some(i) if i > 0 => s[..i]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        _ => false,
    }
}

fn is_reference_path(path: &str) -> bool {
    // Paths from bare strings may still carry a query or fragment
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let lower = path.to_ascii_lowercase();
    REFERENCE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

fn s3_to_https(url: &Url) -> Option<Url> {
    let bucket = url.host_str().filter(|b| !b.is_empty())?;
    let key = url.path().trim_start_matches('/');
    if key.is_empty() {
        return None;
    }
    Url::parse(&format!("https://{bucket}.s3.amazonaws.com/{key}")).ok()
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}
