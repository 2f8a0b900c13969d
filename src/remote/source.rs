//! Byte sources: things that can serve byte ranges of a single object.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::Mmap;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::{header, StatusCode};
use tracing::debug;

use crate::util::{Error, Result};

/// Half-open byte range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range; `end` is exclusive.
    #[inline]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range of `len` bytes starting at `start`.
    #[inline]
    pub const fn at(start: u64, len: u64) -> Self {
        Self { start, end: start + len }
    }

    /// Number of bytes covered.
    #[inline]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Check if the range covers no bytes.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Check if `other` lies entirely inside this range.
    #[inline]
    pub const fn contains(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// HTTP `Range` header value (inclusive end).
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// A single addressable object whose bytes can be read by range.
///
/// Implementations perform exactly one attempt per call; retry policy
/// belongs to the caller.
pub trait ByteSource {
    /// Stable identity of the object, used as the cache key.
    fn id(&self) -> &str;

    /// Total size in bytes.
    fn len(&self) -> Result<u64>;

    /// Read exactly the bytes of `range`.
    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>>;

    /// Check if the object is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for std::sync::Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        (**self).read_range(range)
    }
}

fn check_bounds(id: &str, range: ByteRange, size: u64) -> Result<()> {
    if range.start > range.end || range.end > size {
        return Err(Error::fetch(
            id,
            format!(
                "range {}..{} out of bounds (size {})",
                range.start, range.end, size
            ),
        ));
    }
    Ok(())
}

/// HTTP(S) object read with `Range` requests.
pub struct HttpSource {
    url: String,
    client: Client,
    size: Mutex<Option<u64>>,
}

impl HttpSource {
    /// Create a source for `url` with its own client.
    pub fn new(url: impl Into<String>, timeout: Duration, user_agent: &str) -> Result<Self> {
        let url = url.into();
        let client = build_client(timeout, user_agent)?;
        Ok(Self::with_client(url, client))
    }

    /// Create a source sharing an existing client.
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            size: Mutex::new(None),
        }
    }

    /// The object URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn fetch_len(&self) -> Result<u64> {
        debug!("HEAD {}", self.url);
        let response = self
            .client
            .head(&self.url)
            .send()
            .map_err(|e| Error::fetch(&self.url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::fetch(&self.url, format!("HTTP {status}")));
        }
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::fetch(&self.url, "response carries no Content-Length"))
    }
}

impl ByteSource for HttpSource {
    fn id(&self) -> &str {
        &self.url
    }

    fn len(&self) -> Result<u64> {
        let mut size = self.size.lock();
        if let Some(n) = *size {
            return Ok(n);
        }
        let n = self.fetch_len()?;
        *size = Some(n);
        Ok(n)
    }

    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        check_bounds(&self.url, range, self.len()?)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        debug!("GET {} [{}..{})", self.url, range.start, range.end);
        let response = self
            .client
            .get(&self.url)
            .header(header::RANGE, range.header_value())
            .send()
            .map_err(|e| Error::fetch(&self.url, e.to_string()))?;

        let status = response.status();
        let body = match status {
            StatusCode::PARTIAL_CONTENT => response
                .bytes()
                .map_err(|e| Error::fetch(&self.url, e.to_string()))?
                .to_vec(),
            // Server ignored the Range header and sent the whole object
            StatusCode::OK => {
                let full = response
                    .bytes()
                    .map_err(|e| Error::fetch(&self.url, e.to_string()))?;
                if (full.len() as u64) < range.end {
                    return Err(Error::fetch(
                        &self.url,
                        format!("body of {} bytes is shorter than range end {}", full.len(), range.end),
                    ));
                }
                full[range.start as usize..range.end as usize].to_vec()
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(Error::fetch(&self.url, "range not satisfiable"));
            }
            other => return Err(Error::fetch(&self.url, format!("HTTP {other}"))),
        };

        if body.len() as u64 != range.len() {
            return Err(Error::fetch(
                &self.url,
                format!("expected {} bytes, received {}", range.len(), body.len()),
            ));
        }
        Ok(body)
    }
}

/// Build the blocking HTTP client used by sources and the catalog.
pub fn build_client(timeout: Duration, user_agent: &str) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))
}

/// Local file, memory-mapped when non-empty.
pub struct FileSource {
    id: String,
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl FileSource {
    /// Open a local file. A missing file is a fetch error like any other
    /// unreachable object.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::open_with_id(path, format!("file://{}", path.display()))
    }

    /// Open a local file under an explicit resource id.
    pub fn open_with_id(path: impl AsRef<Path>, id: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let id = id.into();
        let file = File::open(path).map_err(|e| Error::fetch(&id, e.to_string()))?;
        let size = file.metadata()?.len();

        let mmap = if size > 0 {
            // Safety: mapped read-only; callers treat sources as immutable
            Some(unsafe { Mmap::map(&file) }.map_err(|e| Error::fetch(&id, e.to_string()))?)
        } else {
            None
        };

        Ok(Self {
            id,
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn len(&self) -> Result<u64> {
        Ok(self.mmap.as_ref().map_or(0, |m| m.len() as u64))
    }

    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        check_bounds(&self.id, range, self.len()?)?;
        match &self.mmap {
            Some(m) => Ok(m[range.start as usize..range.end as usize].to_vec()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const OBJECT: &[u8] = b"0123456789abcdef";

    /// How the test server answers range requests.
    #[derive(Clone, Copy)]
    enum Reply {
        Partial,
        WholeObject,
        ShortPartial,
        Unsatisfiable,
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => buf.push(byte[0]),
                _ => break,
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn requested_range(request: &str) -> (usize, usize) {
        let spec = request
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("range").then(|| value.trim().to_string())
            })
            .unwrap();
        let (a, b) = spec.trim_start_matches("bytes=").split_once('-').unwrap();
        (a.parse().unwrap(), b.parse::<usize>().unwrap() + 1)
    }

    /// Serve `OBJECT` over plain HTTP on loopback, one request per connection.
    /// Returns the URL and a counter of HEAD requests.
    fn serve(reply: Reply) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&heads);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let request = read_request(&mut stream);
                let response: Vec<u8> = if request.starts_with("HEAD") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        OBJECT.len()
                    )
                    .into_bytes()
                } else {
                    let (start, end) = requested_range(&request);
                    let (status, body) = match reply {
                        Reply::Partial => ("206 Partial Content", &OBJECT[start..end]),
                        Reply::WholeObject => ("200 OK", OBJECT),
                        Reply::ShortPartial => {
                            ("206 Partial Content", &OBJECT[start..start + (end - start) / 2])
                        }
                        Reply::Unsatisfiable => ("416 Range Not Satisfiable", &OBJECT[..0]),
                    };
                    let mut out = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    out.extend_from_slice(body);
                    out
                };
                let _ = stream.write_all(&response);
            }
        });

        (format!("http://{addr}/sub-01.nwb"), heads)
    }

    fn http_source(url: &str) -> HttpSource {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpSource::with_client(url, client)
    }

    #[test]
    fn test_byte_range() {
        let r = ByteRange::at(10, 5);
        assert_eq!(r, ByteRange::new(10, 15));
        assert_eq!(r.len(), 5);
        assert_eq!(r.header_value(), "bytes=10-14");
        assert!(r.contains(&ByteRange::new(11, 15)));
        assert!(!r.contains(&ByteRange::new(9, 12)));
        assert!(ByteRange::new(4, 4).is_empty());
    }

    #[test]
    fn test_file_source_reads() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello nwb").unwrap();
        tmp.flush().unwrap();

        let src = FileSource::open(tmp.path()).unwrap();
        assert_eq!(src.len().unwrap(), 9);
        assert_eq!(src.read_range(ByteRange::new(6, 9)).unwrap(), b"nwb");
        assert!(src.id().starts_with("file://"));
    }

    #[test]
    fn test_file_source_out_of_bounds() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        tmp.flush().unwrap();

        let src = FileSource::open(tmp.path()).unwrap();
        let err = src.read_range(ByteRange::new(2, 8)).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }));
    }

    #[test]
    fn test_missing_file_is_fetch_error() {
        let err = FileSource::open("/nonexistent/definitely/missing.nwb").err().unwrap();
        assert!(err.is_remote());
    }

    #[test]
    fn test_http_partial_content() {
        let (url, heads) = serve(Reply::Partial);
        let src = http_source(&url);
        assert_eq!(src.read_range(ByteRange::new(2, 6)).unwrap(), b"2345");
        assert_eq!(src.read_range(ByteRange::new(10, 16)).unwrap(), b"abcdef");
        assert_eq!(src.len().unwrap(), 16);
        // Size is learned once and reused for every bounds check
        assert_eq!(heads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_http_whole_object_is_sliced() {
        let (url, _) = serve(Reply::WholeObject);
        let src = http_source(&url);
        assert_eq!(src.read_range(ByteRange::new(4, 8)).unwrap(), b"4567");
    }

    #[test]
    fn test_http_short_body_is_fetch_error() {
        let (url, _) = serve(Reply::ShortPartial);
        let src = http_source(&url);
        let err = src.read_range(ByteRange::new(0, 8)).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }), "{err:?}");
    }

    #[test]
    fn test_http_unsatisfiable_is_fetch_error() {
        let (url, heads) = serve(Reply::Unsatisfiable);
        let src = http_source(&url);
        let err = src.read_range(ByteRange::new(0, 4)).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }), "{err:?}");

        // Out-of-bounds ranges are refused before any GET
        let err = src.read_range(ByteRange::new(8, 32)).unwrap_err();
        assert!(err.is_remote());
        assert_eq!(heads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreachable_http() {
        // Port 1 on loopback refuses connections
        let src = HttpSource::new("http://127.0.0.1:1/data.nwb", Duration::from_secs(5), "test")
            .unwrap();
        let err = src.read_range(ByteRange::new(0, 4)).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }));
    }
}
