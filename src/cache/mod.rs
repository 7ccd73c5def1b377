//! In-memory cache of fully prepared static-file responses.
//!
//! Entries are keyed by the absolute file path and the negotiated content
//! coding, so the identity and every compressed variant of a file are stored
//! side by side. There is no eviction: the static-file pipeline only inserts
//! files below its configured size limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::http::{Codec, Headers, StatusCode};

/// A cached response: encoded body plus the status and headers it was sent with.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl CachedFile {
    /// The entity tag stored with this entry, if any.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }
}

type CacheKey = (PathBuf, Option<Codec>);

/// Per-server file cache.
#[derive(Debug, Default)]
pub struct FileCache {
    entries: RwLock<HashMap<CacheKey, Arc<CachedFile>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path, codec: Option<Codec>) -> Option<Arc<CachedFile>> {
        self.entries.read().get(&(path.to_path_buf(), codec)).cloned()
    }

    pub fn insert(&self, path: &Path, codec: Option<Codec>, file: CachedFile) -> Arc<CachedFile> {
        let file = Arc::new(file);
        self.entries
            .write()
            .insert((path.to_path_buf(), codec), file.clone());
        file
    }

    /// Drops every variant cached for `path`. Returns how many were removed.
    pub fn invalidate(&self, path: &Path) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(p, _), _| p != path);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &'static str) -> CachedFile {
        let mut headers = Headers::new();
        headers.append("ETag", "W/\"1-1\"");
        CachedFile {
            status: StatusCode::Ok,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn variants_are_keyed_by_codec() {
        let cache = FileCache::new();
        let path = Path::new("/srv/app.js");
        cache.insert(path, None, entry("plain"));
        cache.insert(path, Some(Codec::Gzip), entry("gz"));

        assert_eq!(&cache.get(path, None).unwrap().body[..], b"plain");
        assert_eq!(&cache.get(path, Some(Codec::Gzip)).unwrap().body[..], b"gz");
        assert!(cache.get(path, Some(Codec::Brotli)).is_none());
        assert_eq!(cache.get(path, None).unwrap().etag(), Some("W/\"1-1\""));
    }

    #[test]
    fn invalidate_removes_all_variants() {
        let cache = FileCache::new();
        let path = Path::new("/srv/app.js");
        cache.insert(path, None, entry("plain"));
        cache.insert(path, Some(Codec::Brotli), entry("br"));
        cache.insert(Path::new("/srv/other.js"), None, entry("x"));

        assert_eq!(cache.invalidate(path), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
