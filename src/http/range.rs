//! Single-range `Range: bytes=…` parsing for file transfers.

/// How a `Range` header applies to a resource of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range: send the whole resource with `200 OK`.
    Full,
    /// Send bytes `start..=end` with `206 Partial Content`.
    Partial { start: u64, end: u64 },
    /// Answer `416 Range Not Satisfiable`.
    Unsatisfiable,
}

impl ByteRange {
    /// Number of bytes this range covers out of `size`.
    pub fn len(&self, size: u64) -> u64 {
        match *self {
            Self::Full => size,
            Self::Partial { start, end } => end - start + 1,
            Self::Unsatisfiable => 0,
        }
    }

    pub fn is_empty(&self, size: u64) -> bool {
        self.len(size) == 0
    }
}

/// Resolves a `Range` header against a resource of `size` bytes.
///
/// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. A header
/// that is absent, uses another unit, lists several ranges or does not parse is
/// ignored ([`ByteRange::Full`]). An `end` at or beyond `size`, or a range
/// covering no bytes, is [`ByteRange::Unsatisfiable`].
///
/// # Examples
///
/// ```
/// use wharf::http::range::{resolve, ByteRange};
///
/// assert_eq!(resolve(Some("bytes=0-0"), 10), ByteRange::Partial { start: 0, end: 0 });
/// assert_eq!(resolve(Some("bytes=20-30"), 10), ByteRange::Unsatisfiable);
/// assert_eq!(resolve(None, 10), ByteRange::Full);
/// ```
pub fn resolve(header: Option<&str>, size: u64) -> ByteRange {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());
    let size = size as i128;

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return ByteRange::Full,
        (true, false) => match last.parse::<u64>() {
            Ok(suffix) => ((size - suffix as i128).max(0), size - 1),
            Err(_) => return ByteRange::Full,
        },
        (false, true) => match first.parse::<u64>() {
            Ok(start) => (start as i128, size - 1),
            Err(_) => return ByteRange::Full,
        },
        (false, false) => match (first.parse::<u64>(), last.parse::<u64>()) {
            (Ok(start), Ok(end)) => (start as i128, end as i128),
            _ => return ByteRange::Full,
        },
    };

    let total = end - start + 1;
    if end >= size || total <= 0 {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
        start: start as u64,
        end: end as u64,
    }
}
