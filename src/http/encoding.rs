//! Response compression: `Accept-Encoding` negotiation and the codecs behind it.
//!
//! Negotiation is recomputed for every request; its result only ever persists
//! as part of a file-cache key.

use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Bodies smaller than this are never compressed.
pub const DEFAULT_MIN_COMPRESS_SIZE: u64 = 1280;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_LGWIN: u32 = 22;

/// A content coding the server can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Brotli,
    Gzip,
    Deflate,
}

impl Codec {
    /// Server preference order used when the client ranks codecs equally.
    pub const PREFERRED: [Codec; 3] = [Codec::Brotli, Codec::Gzip, Codec::Deflate];

    /// The `Content-Encoding` token for this codec.
    pub fn token(self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn accepts_token(self, token: &str) -> bool {
        match self {
            Self::Brotli => token == "br",
            Self::Gzip => token == "gzip" || token == "x-gzip",
            Self::Deflate => token == "deflate",
        }
    }
}

/// Parses `Accept-Encoding` into lowercase `(token, q)` pairs.
///
/// Entries with a malformed `q` are treated as `q=1`; `q` is clamped to `0..=1`.
pub fn parse_accept_encoding(value: &str) -> Vec<(String, f32)> {
    value
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let token = parts.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            let q = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            Some((token, q))
        })
        .collect()
}

/// Picks the codec to use for a response.
///
/// `allowed` lists the codecs the server is willing to produce, in preference
/// order. The client's highest q-value wins; ties go to the earlier entry of
/// `allowed`. `q=0` excludes a codec, and `*` covers codecs the client did not
/// name explicitly.
///
/// # Examples
///
/// ```
/// use wharf::http::encoding::{negotiate, Codec};
///
/// let allowed = Codec::PREFERRED;
/// assert_eq!(negotiate(Some("gzip, br"), &allowed), Some(Codec::Brotli));
/// assert_eq!(negotiate(Some("gzip, br;q=0.5"), &allowed), Some(Codec::Gzip));
/// assert_eq!(negotiate(Some("identity"), &allowed), None);
/// ```
pub fn negotiate(accept_encoding: Option<&str>, allowed: &[Codec]) -> Option<Codec> {
    let ranked = parse_accept_encoding(accept_encoding?);
    let wildcard = ranked.iter().find(|(t, _)| t == "*").map(|(_, q)| *q);

    let mut best: Option<(Codec, f32)> = None;
    for &codec in allowed {
        let explicit = ranked
            .iter()
            .find(|(t, _)| codec.accepts_token(t))
            .map(|(_, q)| *q);
        let Some(q) = explicit.or(wildcard) else {
            continue;
        };
        if q <= 0.0 {
            continue;
        }
        if best.is_none_or(|(_, best_q)| q > best_q) {
            best = Some((codec, q));
        }
    }
    best.map(|(codec, _)| codec)
}

/// Returns `true` for MIME types worth compressing.
pub fn is_compressible(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence,
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/wasm"
                | "application/manifest+json"
                | "image/svg+xml"
                | "font/ttf"
                | "font/otf"
        )
}

/// Write target shared between an encoder and the code draining its output.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn take(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.0.lock()))
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Inner {
    Gzip(GzEncoder<Sink>),
    Deflate(ZlibEncoder<Sink>),
    Brotli(Box<brotli::CompressorWriter<Sink>>),
}

/// A streaming compressor: feed it chunks, collect whatever compressed output
/// is ready, then [`finish`](Self::finish) to flush the trailer.
pub struct Encoder {
    inner: Inner,
    sink: Sink,
}

impl Encoder {
    pub fn new(codec: Codec) -> Self {
        let sink = Sink::default();
        let inner = match codec {
            Codec::Gzip => Inner::Gzip(GzEncoder::new(sink.clone(), Compression::default())),
            Codec::Deflate => Inner::Deflate(ZlibEncoder::new(sink.clone(), Compression::default())),
            Codec::Brotli => Inner::Brotli(Box::new(brotli::CompressorWriter::new(
                sink.clone(),
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            ))),
        };
        Self { inner, sink }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            Inner::Gzip(e) => e.write_all(data),
            Inner::Deflate(e) => e.write_all(data),
            Inner::Brotli(e) => e.write_all(data),
        }
    }

    /// Compresses `data` and returns the output produced so far (possibly empty).
    pub fn push(&mut self, data: &[u8]) -> io::Result<Bytes> {
        self.write(data)?;
        Ok(self.sink.take())
    }

    /// Ends the stream and returns the remaining output.
    pub fn finish(self) -> io::Result<Bytes> {
        match self.inner {
            Inner::Gzip(e) => {
                e.finish()?;
            }
            Inner::Deflate(e) => {
                e.finish()?;
            }
            // Dropping the brotli writer emits the final block.
            Inner::Brotli(e) => drop(e),
        }
        Ok(self.sink.take())
    }
}

/// One-shot compression of a complete body.
pub fn compress(codec: Codec, data: &[u8]) -> io::Result<Bytes> {
    let mut encoder = Encoder::new(codec);
    encoder.write(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn q_values_rank_codecs() {
        let allowed = Codec::PREFERRED;
        assert_eq!(
            negotiate(Some("deflate;q=0.9, gzip;q=0.8"), &allowed),
            Some(Codec::Deflate)
        );
        assert_eq!(negotiate(Some("gzip, deflate"), &allowed), Some(Codec::Gzip));
    }

    #[test]
    fn ties_follow_server_order() {
        assert_eq!(
            negotiate(Some("deflate, gzip"), &[Codec::Gzip, Codec::Deflate]),
            Some(Codec::Gzip)
        );
        assert_eq!(
            negotiate(Some("deflate, gzip"), &[Codec::Deflate, Codec::Gzip]),
            Some(Codec::Deflate)
        );
    }

    #[test]
    fn wildcard_and_exclusions() {
        let allowed = Codec::PREFERRED;
        assert_eq!(negotiate(Some("*"), &allowed), Some(Codec::Brotli));
        assert_eq!(negotiate(Some("*, br;q=0"), &allowed), Some(Codec::Gzip));
        assert_eq!(negotiate(Some("gzip;q=0"), &allowed), None);
        assert_eq!(negotiate(None, &allowed), None);
        assert_eq!(negotiate(Some("br"), &[Codec::Gzip]), None);
    }

    #[test]
    fn compressible_types() {
        assert!(is_compressible("text/html; charset=utf-8"));
        assert!(is_compressible("application/json"));
        assert!(is_compressible("image/svg+xml"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("application/octet-stream"));
    }

    #[test]
    fn gzip_output_decodes() {
        let input = "hello compression ".repeat(200);
        let packed = compress(Codec::Gzip, input.as_bytes()).unwrap();
        assert!(packed.len() < input.len());
        let mut out = String::new();
        flate2::read::GzDecoder::new(&packed[..])
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn streamed_brotli_matches_input() {
        let input = "streamed brotli chunk ".repeat(500);
        let mut encoder = Encoder::new(Codec::Brotli);
        let mut packed = Vec::new();
        for chunk in input.as_bytes().chunks(1000) {
            packed.extend_from_slice(&encoder.push(chunk).unwrap());
        }
        packed.extend_from_slice(&encoder.finish().unwrap());

        let mut out = Vec::new();
        brotli::Decompressor::new(&packed[..], 4096)
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, input.as_bytes());
    }
}
