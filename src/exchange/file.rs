//! Static-file responses.
//!
//! [`Exchange::file`] negotiates a content coding, answers from the per-server
//! [`FileCache`](crate::cache::FileCache) when it can, and otherwise either
//! reads the file whole (small files, cacheable) or streams it in fixed-size
//! chunks (large files and `Range` requests).

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::Exchange;
use crate::BoxError;
use crate::cache::CachedFile;
use crate::http::encoding::{self, Codec, DEFAULT_MIN_COMPRESS_SIZE, Encoder};
use crate::http::range::{self, ByteRange};
use crate::http::{Headers, Method, StatusCode, http_date};

/// Rewrites file contents before they are compressed and cached.
pub type TransformFn = Arc<dyn Fn(&Path, Bytes) -> Result<Bytes, BoxError> + Send + Sync>;

/// Errors produced while serving a file.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transform failed for {}: {source}", path.display())]
    Transform { path: PathBuf, source: BoxError },

    #[error("compression failed: {0}")]
    Compression(#[source] io::Error),

    #[error("response write failed: {0}")]
    Write(#[source] io::Error),

    #[error("response already started")]
    ResponseStarted,
}

/// What [`Exchange::file`] did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// A response was sent.
    Served,
    /// The file does not exist and `fallthrough` is on; nothing was sent.
    Unhandled,
}

/// Per-call static-file settings.
#[derive(Clone)]
pub struct FileOptions {
    /// Report a missing file as [`FileOutcome::Unhandled`] instead of an error.
    pub fallthrough: bool,
    /// Codecs the server may use, in preference order.
    pub compress: Vec<Codec>,
    /// Files smaller than this are never compressed.
    pub min_compress_size: u64,
    /// Largest file kept in the cache.
    pub max_cache_size: u64,
    /// Files at least this large and too big to cache are streamed.
    pub stream_threshold: u64,
    /// Read size of each streamed chunk.
    pub chunk_size: usize,
    /// Extra headers added to every file response.
    pub headers: Headers,
    pub transform: Option<TransformFn>,
    /// Whether to use the per-server file cache.
    pub cache: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            fallthrough: true,
            compress: Codec::PREFERRED.to_vec(),
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
            max_cache_size: 1024 * 1024,
            stream_threshold: 1024 * 1024,
            chunk_size: 64 * 1024,
            headers: Headers::new(),
            transform: None,
            cache: true,
        }
    }
}

impl fmt::Debug for FileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileOptions")
            .field("fallthrough", &self.fallthrough)
            .field("compress", &self.compress)
            .field("min_compress_size", &self.min_compress_size)
            .field("max_cache_size", &self.max_cache_size)
            .field("stream_threshold", &self.stream_threshold)
            .field("chunk_size", &self.chunk_size)
            .field("transform", &self.transform.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

impl FileOptions {
    pub fn fallthrough(mut self, on: bool) -> Self {
        self.fallthrough = on;
        self
    }

    pub fn compress(mut self, codecs: impl Into<Vec<Codec>>) -> Self {
        self.compress = codecs.into();
        self
    }

    pub fn min_compress_size(mut self, bytes: u64) -> Self {
        self.min_compress_size = bytes;
        self
    }

    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn stream_threshold(mut self, bytes: u64) -> Self {
        self.stream_threshold = bytes;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, Bytes) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn cache(mut self, on: bool) -> Self {
        self.cache = on;
        self
    }
}

/// Joins a request-supplied relative path onto `root`, refusing anything that
/// could escape it (`..`, absolute paths, drive prefixes).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use wharf::exchange::file::safe_join;
///
/// assert_eq!(safe_join("/srv", "css/site.css"), Some(Path::new("/srv/css/site.css").into()));
/// assert_eq!(safe_join("/srv", "../etc/passwd"), None);
/// ```
pub fn safe_join(root: impl AsRef<Path>, relative: &str) -> Option<PathBuf> {
    let mut path = root.as_ref().to_path_buf();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

/// Facts about the file on disk that shape every response for it.
struct Stat {
    size: u64,
    etag: String,
    last_modified: Option<String>,
    content_type: String,
    compressible: bool,
}

impl Stat {
    fn etag_for(&self, codec: Option<Codec>) -> String {
        match codec {
            Some(codec) => format!("W/\"{}-{}\"", self.etag, codec.token()),
            None => format!("W/\"{}\"", self.etag),
        }
    }

    /// Headers shared by full, ranged and not-modified answers.
    fn headers(&self, codec: Option<Codec>, extra: &Headers) -> Headers {
        let mut headers = Headers::with_capacity(8 + extra.len());
        headers.append("Content-Type", self.content_type.as_str());
        headers.append("ETag", self.etag_for(codec));
        if let Some(last_modified) = &self.last_modified {
            headers.append("Last-Modified", last_modified.as_str());
        }
        headers.append("Accept-Ranges", "bytes");
        if self.compressible {
            headers.append("Vary", "Accept-Encoding");
        }
        if let Some(codec) = codec {
            headers.append("Content-Encoding", codec.token());
        }
        for (name, value) in extra.iter() {
            headers.append(name, value);
        }
        headers
    }
}

fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let essence = mime.essence_str();
    if mime.type_() == mime_guess::mime::TEXT
        || matches!(essence, "application/javascript" | "application/json")
    {
        format!("{essence}; charset=utf-8")
    } else {
        essence.to_owned()
    }
}

/// `true` when `if_none_match` lists `etag` (weak comparison) or `*`.
fn etag_matches(if_none_match: Option<&str>, etag: &str) -> bool {
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_owned();
    let target = opaque(etag);
    if_none_match.is_some_and(|list| {
        list.split(',')
            .any(|candidate| candidate.trim() == "*" || opaque(candidate) == target)
    })
}

fn mtime_secs(modified: Option<SystemTime>) -> u64 {
    modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

impl Exchange {
    /// Serves the file at `path`.
    ///
    /// # Errors
    ///
    /// - [`FileError::NotFound`] when the file is missing and `fallthrough` is off.
    /// - [`FileError::ResponseStarted`] when output was already written.
    /// - I/O, transform and transport failures.
    pub async fn file(&mut self, path: impl AsRef<Path>, options: &FileOptions) -> Result<FileOutcome, FileError> {
        if self.is_handled() {
            return Err(FileError::ResponseStarted);
        }
        let path = std::path::absolute(path.as_ref()).map_err(|source| FileError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        let content_type = content_type_for(&path);
        let compressible = encoding::is_compressible(&content_type);
        let range_header = self.header("range").map(str::to_owned);
        let if_none_match = self.header("if-none-match").map(str::to_owned);
        let negotiated = if compressible {
            encoding::negotiate(self.header("accept-encoding"), &options.compress)
        } else {
            None
        };

        if options.cache && range_header.is_none() {
            if let Some(hit) = self.services.cache.get(&path, negotiated) {
                debug!(path = %path.display(), codec = ?negotiated, "file cache hit");
                self.respond_cached(&hit, if_none_match.as_deref()).await?;
                return Ok(FileOutcome::Served);
            }
        }

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return self.missing(path, options),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.missing(path, options),
            Err(source) => return Err(FileError::Io { path, source }),
        };
        let modified = metadata.modified().ok();
        let size = metadata.len();
        let stat = Stat {
            size,
            etag: format!("{size:x}-{:x}", mtime_secs(modified)),
            last_modified: modified.map(http_date),
            content_type,
            compressible,
        };
        let codec = negotiated.filter(|_| size >= options.min_compress_size);

        if range_header.is_some() || (size >= options.stream_threshold && size > options.max_cache_size) {
            return self
                .stream_file(&path, &stat, range_header.as_deref(), if_none_match.as_deref(), codec, options)
                .await;
        }

        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| FileError::Io { path: path.clone(), source })?;
        let mut body = Bytes::from(raw);
        if let Some(transform) = &options.transform {
            body = transform(&path, body).map_err(|source| FileError::Transform {
                path: path.clone(),
                source,
            })?;
        }
        if let Some(codec) = codec {
            body = encoding::compress(codec, &body).map_err(FileError::Compression)?;
        }

        let entry = CachedFile {
            status: StatusCode::Ok,
            headers: stat.headers(codec, &options.headers),
            body,
        };
        if options.cache && size <= options.max_cache_size {
            // Keyed by what the client negotiated, so small files that were not
            // compressed still hit for compression-capable clients.
            let entry = self.services.cache.insert(&path, negotiated, entry);
            self.respond_cached(&entry, if_none_match.as_deref()).await?;
        } else {
            self.respond_cached(&entry, if_none_match.as_deref()).await?;
        }
        Ok(FileOutcome::Served)
    }

    fn missing(&self, path: PathBuf, options: &FileOptions) -> Result<FileOutcome, FileError> {
        if options.fallthrough {
            debug!(path = %path.display(), "file not found, falling through");
            Ok(FileOutcome::Unhandled)
        } else {
            Err(FileError::NotFound { path })
        }
    }

    /// Answers with a prepared entry, or `304` when the client already has it.
    async fn respond_cached(&mut self, entry: &CachedFile, if_none_match: Option<&str>) -> Result<(), FileError> {
        let not_modified = entry
            .etag()
            .is_some_and(|etag| etag_matches(if_none_match, etag));
        self.status = if not_modified {
            StatusCode::NotModified
        } else {
            entry.status
        };
        for (name, value) in entry.headers.iter() {
            self.headers.append(name, value);
        }
        let body: &[u8] = if not_modified { b"" } else { &entry.body };
        self.end(body).await.map_err(FileError::Write)
    }

    /// Ranged or large-file transfer pumped in `chunk_size` pieces.
    async fn stream_file(
        &mut self,
        path: &Path,
        stat: &Stat,
        range_header: Option<&str>,
        if_none_match: Option<&str>,
        codec: Option<Codec>,
        options: &FileOptions,
    ) -> Result<FileOutcome, FileError> {
        let range = range::resolve(range_header, stat.size);
        // Ranges address the identity representation.
        let codec = codec.filter(|_| range == ByteRange::Full);
        for (name, value) in stat.headers(codec, &options.headers).iter() {
            self.headers.append(name, value);
        }

        let (start, len) = match range {
            ByteRange::Unsatisfiable => {
                self.status = StatusCode::RangeNotSatisfiable;
                self.headers.set("Content-Range", format!("bytes */{}", stat.size));
                self.headers.set("Content-Length", "0");
                self.end(b"").await.map_err(FileError::Write)?;
                return Ok(FileOutcome::Served);
            }
            ByteRange::Partial { start, end } => {
                self.status = StatusCode::PartialContent;
                self.headers
                    .set("Content-Range", format!("bytes {start}-{end}/{}", stat.size));
                self.headers.set("Content-Length", (end - start + 1).to_string());
                (start, end - start + 1)
            }
            ByteRange::Full => {
                if etag_matches(if_none_match, &stat.etag_for(codec)) {
                    self.status = StatusCode::NotModified;
                    self.end(b"").await.map_err(FileError::Write)?;
                    return Ok(FileOutcome::Served);
                }
                if codec.is_none() {
                    self.headers.set("Content-Length", stat.size.to_string());
                }
                (0, stat.size)
            }
        };

        if *self.method() == Method::Head || len == 0 {
            self.end(b"").await.map_err(FileError::Write)?;
            return Ok(FileOutcome::Served);
        }

        let io_err = |source| FileError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(start)).await.map_err(io_err)?;
        let mut buf = vec![0u8; options.chunk_size.max(1)];
        let mut remaining = len;
        let mut encoder = codec.map(Encoder::new);

        // Headers go out before the first disk read.
        self.write(b"").await.map_err(FileError::Write)?;
        while remaining > 0 {
            if self.is_aborted() {
                debug!(path = %path.display(), remaining, "file transfer aborted");
                return Ok(FileOutcome::Served);
            }
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await.map_err(io_err)?;
            if n == 0 {
                warn!(path = %path.display(), remaining, "file shrank during transfer");
                break;
            }
            remaining -= n as u64;
            match encoder.as_mut() {
                Some(encoder) => {
                    let out = encoder.push(&buf[..n]).map_err(FileError::Compression)?;
                    if !out.is_empty() {
                        self.write(&out).await.map_err(FileError::Write)?;
                    }
                }
                None => self.pump(&buf[..n]).await.map_err(FileError::Write)?,
            }
        }

        let tail = match encoder {
            Some(encoder) => encoder.finish().map_err(FileError::Compression)?,
            None => Bytes::new(),
        };
        self.end(&tail).await.map_err(FileError::Write)?;
        Ok(FileOutcome::Served)
    }

    /// Writes raw body bytes, resuming each partial write at the acknowledged
    /// offset so no byte is sent twice.
    async fn pump(&mut self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            match self.conn.write_some(&data[offset..]).await {
                Ok(n) => {
                    offset += n;
                    self.body_sent += n as u64;
                }
                Err(e) => {
                    self.fire_abort();
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};

    use flate2::read::GzDecoder;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::config::ServerConfig;
    use crate::exchange::Phase;
    use crate::exchange::tests::{exchange, exchange_over};

    const TEN: &[u8] = b"0123456789";

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ten.txt"), TEN).unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log('wharf');\n".repeat(200)).unwrap();
        std::fs::write(dir.path().join("logo.png"), [0x89u8, b'P', b'N', b'G']).unwrap();
        dir
    }

    struct Reply {
        head: String,
        body: Vec<u8>,
    }

    async fn reply(ex: Exchange, mut client: DuplexStream) -> Reply {
        drop(ex);
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let split = memchr::memmem::find(&raw, b"\r\n\r\n").unwrap() + 4;
        Reply {
            head: String::from_utf8(raw[..split].to_vec()).unwrap(),
            body: raw[split..].to_vec(),
        }
    }

    fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
        head.lines().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    #[tokio::test]
    async fn serves_whole_file_with_validators() {
        let dir = site();
        let (mut ex, client) = exchange("GET /ten.txt HTTP/1.1\r\n\r\n").await;
        let outcome = ex.file(dir.path().join("ten.txt"), &FileOptions::default()).await.unwrap();
        assert_eq!(outcome, FileOutcome::Served);
        let r = reply(ex, client).await;
        assert!(r.head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(header(&r.head, "content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(header(&r.head, "content-length"), Some("10"));
        assert!(header(&r.head, "etag").unwrap().starts_with("W/\"a-"));
        assert!(header(&r.head, "last-modified").unwrap().ends_with(" GMT"));
        assert_eq!(r.body, TEN);
    }

    #[tokio::test]
    async fn matching_etag_yields_304() {
        let dir = site();
        let path = dir.path().join("ten.txt");
        let (mut ex, client) = exchange("GET /ten.txt HTTP/1.1\r\n\r\n").await;
        ex.file(&path, &FileOptions::default()).await.unwrap();
        let etag = header(&reply(ex, client).await.head, "etag").unwrap().to_owned();

        let (mut ex, client) = exchange(&format!("GET /ten.txt HTTP/1.1\r\nIf-None-Match: {etag}\r\n\r\n")).await;
        ex.file(&path, &FileOptions::default().cache(false)).await.unwrap();
        let r = reply(ex, client).await;
        assert!(r.head.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(r.body.is_empty());
    }

    #[tokio::test]
    async fn single_byte_range() {
        let dir = site();
        let (mut ex, client) = exchange("GET /ten.txt HTTP/1.1\r\nRange: bytes=0-0\r\n\r\n").await;
        ex.file(dir.path().join("ten.txt"), &FileOptions::default()).await.unwrap();
        let r = reply(ex, client).await;
        assert!(r.head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert_eq!(header(&r.head, "content-range"), Some("bytes 0-0/10"));
        assert_eq!(header(&r.head, "accept-ranges"), Some("bytes"));
        assert_eq!(r.body, b"0");
    }

    #[tokio::test]
    async fn suffix_range() {
        let dir = site();
        let (mut ex, client) = exchange("GET /ten.txt HTTP/1.1\r\nRange: bytes=-3\r\n\r\n").await;
        ex.file(dir.path().join("ten.txt"), &FileOptions::default()).await.unwrap();
        let r = reply(ex, client).await;
        assert_eq!(header(&r.head, "content-range"), Some("bytes 7-9/10"));
        assert_eq!(r.body, b"789");
    }

    #[tokio::test]
    async fn unsatisfiable_range() {
        let dir = site();
        let (mut ex, client) = exchange("GET /ten.txt HTTP/1.1\r\nRange: bytes=20-30\r\n\r\n").await;
        ex.file(dir.path().join("ten.txt"), &FileOptions::default()).await.unwrap();
        let r = reply(ex, client).await;
        assert!(r.head.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert_eq!(header(&r.head, "content-range"), Some("bytes */10"));
        assert!(r.body.is_empty());
    }

    #[tokio::test]
    async fn cache_keeps_encodings_apart() {
        let dir = site();
        let path = dir.path().join("app.js");
        let original = std::fs::read(&path).unwrap();
        let options = FileOptions::default();

        let (mut ex, client) = exchange("GET /app.js HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n").await;
        ex.file(&path, &options).await.unwrap();
        let services = ex.services.clone();
        let gz = reply(ex, client).await;
        assert_eq!(header(&gz.head, "content-encoding"), Some("gzip"));
        assert_eq!(header(&gz.head, "vary"), Some("Accept-Encoding"));
        let mut decoded = Vec::new();
        GzDecoder::new(&gz.body[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, original);

        let (mut ex, client) = exchange("GET /app.js HTTP/1.1\r\n\r\n").await;
        ex.services = services.clone();
        ex.file(&path, &options).await.unwrap();
        let plain = reply(ex, client).await;
        assert_eq!(header(&plain.head, "content-encoding"), None);
        assert_eq!(plain.body, original);

        // Both variants are cached; a second gzip client is served from cache.
        assert_eq!(services.cache.len(), 2);
        let (mut ex, client) = exchange("GET /app.js HTTP/1.1\r\nAccept-Encoding: gzip;q=1, br;q=0\r\n\r\n").await;
        ex.services = services.clone();
        ex.file(&path, &options).await.unwrap();
        assert_eq!(reply(ex, client).await.body, gz.body);
    }

    #[tokio::test]
    async fn small_and_binary_files_are_not_compressed() {
        let dir = site();
        for name in ["ten.txt", "logo.png"] {
            let (mut ex, client) = exchange("GET / HTTP/1.1\r\nAccept-Encoding: gzip, br\r\n\r\n").await;
            ex.file(dir.path().join(name), &FileOptions::default()).await.unwrap();
            assert_eq!(header(&reply(ex, client).await.head, "content-encoding"), None);
        }
    }

    #[tokio::test]
    async fn missing_file_falls_through_or_errors() {
        let dir = site();
        let (mut ex, _client) = exchange("GET /nope HTTP/1.1\r\n\r\n").await;
        let path = dir.path().join("nope");
        assert_eq!(ex.file(&path, &FileOptions::default()).await.unwrap(), FileOutcome::Unhandled);
        assert!(!ex.is_handled());
        let err = ex.file(&path, &FileOptions::default().fallthrough(false)).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound { .. }));
    }

    #[tokio::test]
    async fn large_files_are_streamed_uncached() {
        let dir = site();
        let path = dir.path().join("app.js");
        let original = std::fs::read(&path).unwrap();
        let options = FileOptions::default().stream_threshold(16).max_cache_size(16).chunk_size(100);

        let (mut ex, client) = exchange("GET /app.js HTTP/1.1\r\n\r\n").await;
        ex.file(&path, &options).await.unwrap();
        let services = ex.services.clone();
        let r = reply(ex, client).await;
        assert_eq!(header(&r.head, "content-length"), Some(original.len().to_string().as_str()));
        assert_eq!(r.body, original);
        assert!(services.cache.is_empty());
    }

    #[tokio::test]
    async fn streamed_compression_uses_chunked_encoding() {
        let dir = site();
        let path = dir.path().join("app.js");
        let options = FileOptions::default().stream_threshold(16).max_cache_size(16).chunk_size(512);

        let (mut ex, client) = exchange("GET /app.js HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n").await;
        ex.file(&path, &options).await.unwrap();
        let r = reply(ex, client).await;
        assert_eq!(header(&r.head, "content-encoding"), Some("gzip"));
        assert_eq!(header(&r.head, "transfer-encoding"), Some("chunked"));
        assert_eq!(header(&r.head, "content-length"), None);
        assert!(r.body.ends_with(b"0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_compressed_stream_is_close_delimited() {
        let dir = site();
        let path = dir.path().join("app.js");
        let original = std::fs::read(&path).unwrap();
        let options = FileOptions::default().stream_threshold(16).max_cache_size(16).chunk_size(512);

        let (mut ex, client) = exchange("GET /app.js HTTP/1.0\r\nAccept-Encoding: gzip\r\n\r\n").await;
        ex.file(&path, &options).await.unwrap();
        let r = reply(ex, client).await;
        assert_eq!(header(&r.head, "content-encoding"), Some("gzip"));
        assert_eq!(header(&r.head, "transfer-encoding"), None);
        assert_eq!(header(&r.head, "connection"), Some("close"));
        let mut decoded = Vec::new();
        GzDecoder::new(&r.body[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn dropped_client_stops_the_transfer() {
        const SIZE: usize = 64 * 1024;
        let dir = site();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![b'x'; SIZE]).unwrap();
        let options = FileOptions::default().stream_threshold(16).max_cache_size(16).chunk_size(256);

        let (mut ex, mut client) = exchange_over("GET /big.bin HTTP/1.1\r\n\r\n", ServerConfig::default(), 64).await;
        let fired = Arc::new(AtomicBool::new(false));
        let observer = fired.clone();
        ex.on_abort(move || observer.store(true, Ordering::SeqCst));

        let peer = tokio::spawn(async move {
            let mut first = vec![0u8; 1024];
            client.read_exact(&mut first).await.unwrap();
        });

        let result = ex.file(&path, &options).await;
        peer.await.unwrap();

        assert!(matches!(result, Err(FileError::Write(_))));
        assert!(ex.is_aborted());
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(ex.phase(), Phase::Ended);
        assert!(ex.conn.bytes_written() < SIZE as u64);
    }

    #[tokio::test]
    async fn head_request_sends_headers_only() {
        let dir = site();
        let (mut ex, client) = exchange("HEAD /ten.txt HTTP/1.1\r\n\r\n").await;
        ex.file(dir.path().join("ten.txt"), &FileOptions::default()).await.unwrap();
        let r = reply(ex, client).await;
        assert_eq!(header(&r.head, "content-length"), Some("10"));
        assert!(r.body.is_empty());
    }

    #[tokio::test]
    async fn transform_runs_before_caching() {
        let dir = site();
        let options = FileOptions::default().transform(|_, body| Ok(Bytes::from(body.to_ascii_uppercase())));
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        let (mut ex, client) = exchange("GET /hello.txt HTTP/1.1\r\n\r\n").await;
        ex.file(dir.path().join("hello.txt"), &options).await.unwrap();
        assert_eq!(reply(ex, client).await.body, b"HELLO");
    }

    #[test]
    fn etag_comparison_is_weak() {
        assert!(etag_matches(Some("\"a-1\""), "W/\"a-1\""));
        assert!(etag_matches(Some("W/\"x\", W/\"a-1\""), "W/\"a-1\""));
        assert!(etag_matches(Some("*"), "W/\"a-1\""));
        assert!(!etag_matches(Some("W/\"b-1\""), "W/\"a-1\""));
        assert!(!etag_matches(None, "W/\"a-1\""));
    }

    #[test]
    fn joins_stay_inside_root() {
        assert_eq!(safe_join("/srv", "/a/./b.txt"), Some(PathBuf::from("/srv/a/b.txt")));
        assert_eq!(safe_join("/srv", "a/../../x"), None);
    }
}
