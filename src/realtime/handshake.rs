//! RFC 6455 opening handshake.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::response::encode_head;
use crate::http::{Headers, RequestHead, StatusCode};

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Reasons an upgrade request is refused with `400 Bad Request`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported Sec-WebSocket-Version {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
}

/// Computes `Sec-WebSocket-Accept` for a client key.
///
/// # Examples
///
/// ```
/// use wharf::realtime::handshake::accept_key;
///
/// // Sample handshake from RFC 6455 §1.3.
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validated upgrade parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    pub key: String,
    /// Subprotocols the client offered, in its order.
    pub protocols: Vec<String>,
}

impl Upgrade {
    /// Validates the WebSocket-specific headers of an upgrade request.
    pub fn from_head(head: &RequestHead) -> Result<Self, HandshakeError> {
        let headers = head.headers();
        let version = headers.get("sec-websocket-version").map(str::trim);
        if version != Some(WEBSOCKET_VERSION) {
            return Err(HandshakeError::UnsupportedVersion(version.map(str::to_owned)));
        }
        let key = headers
            .get("sec-websocket-key")
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingKey)?
            .to_owned();
        let protocols = headers
            .get_all("sec-websocket-protocol")
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_owned())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(Self { key, protocols })
    }

    /// Picks the first offered subprotocol that the route supports.
    pub fn select_protocol<'a>(&'a self, supported: &[String]) -> Option<&'a str> {
        self.protocols
            .iter()
            .find(|offered| supported.iter().any(|s| s == *offered))
            .map(String::as_str)
    }

    /// Encodes the `101 Switching Protocols` response.
    pub fn response(&self, protocol: Option<&str>) -> BytesMut {
        let mut headers = Headers::with_capacity(4);
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append("Sec-WebSocket-Accept", accept_key(&self.key));
        if let Some(protocol) = protocol {
            headers.append("Sec-WebSocket-Protocol", protocol);
        }
        let mut buf = BytesMut::new();
        encode_head(StatusCode::SwitchingProtocols, &headers, &mut buf);
        buf
    }
}

/// Encodes the `400 Bad Request` sent for a refused upgrade.
pub fn rejection(error: &HandshakeError) -> BytesMut {
    let body = error.to_string();
    let mut headers = Headers::with_capacity(4);
    if matches!(error, HandshakeError::UnsupportedVersion(_)) {
        headers.append("Sec-WebSocket-Version", WEBSOCKET_VERSION);
    }
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Content-Length", body.len().to_string());
    headers.append("Connection", "close");
    let mut buf = BytesMut::new();
    encode_head(StatusCode::BadRequest, &headers, &mut buf);
    buf.extend_from_slice(body.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(extra: &str) -> RequestHead {
        let raw = format!(
            "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n{extra}\r\n"
        );
        RequestHead::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn valid_upgrade_produces_101() {
        let upgrade = Upgrade::from_head(&head(
            "Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        ))
        .unwrap();
        let text = String::from_utf8(upgrade.response(None).to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let err = Upgrade::from_head(&head("Sec-WebSocket-Version: 8\r\nSec-WebSocket-Key: k\r\n"))
            .unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedVersion(Some("8".into())));
        let text = String::from_utf8(rejection(&err).to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[test]
    fn missing_key_is_rejected() {
        assert_eq!(
            Upgrade::from_head(&head("Sec-WebSocket-Version: 13\r\n")),
            Err(HandshakeError::MissingKey)
        );
    }

    #[test]
    fn subprotocol_selection_follows_client_order() {
        let upgrade = Upgrade::from_head(&head(
            "Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Protocol: v2.chat, v1.chat\r\n",
        ))
        .unwrap();
        let supported = vec!["v1.chat".to_owned(), "v2.chat".to_owned()];
        assert_eq!(upgrade.select_protocol(&supported), Some("v2.chat"));
        assert_eq!(upgrade.select_protocol(&[]), None);
    }
}
