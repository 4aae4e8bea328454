//! WebSocket opening handshake (RFC 6455 Section 4.2).
//!
//! Validation and response writing are pure. [`accept`] ties them to a
//! [`Hijacker`], the HTTP layer's ability to hand over its raw stream, and
//! produces an open [`WebSocket`].

use std::io;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::WebSocket;
use crate::error::{Error, HandshakeError, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
///
/// # Example
///
/// ```
/// use wsraw::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    BASE64.encode(hash)
}

/// HTTP header collection with case-insensitive names.
///
/// Keeps every occurrence of a repeated header, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed HTTP/1.1 request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target as sent, including any query string.
    pub uri: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub version: String,
    pub headers: HeaderMap,
}

impl HandshakeRequest {
    /// Parse a request head (request line, header lines, blank line).
    ///
    /// Only the HTTP framing is checked here; WebSocket requirements are
    /// checked by [`validate`](Self::validate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if:
    /// - The data is not valid UTF-8.
    /// - The request line is missing or does not have three parts.
    /// - The version is not HTTP/1.x.
    /// - A header line has no colon or an empty name.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();

        // Parse request line: "GET /path HTTP/1.1"
        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty request".into()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, uri, version] = parts.as_slice() else {
            return Err(Error::InvalidHandshake("Invalid request line".into()));
        };

        if !version.starts_with("HTTP/1.") {
            return Err(Error::InvalidHandshake(format!(
                "Expected HTTP/1.x, got {}",
                version
            )));
        }

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::InvalidHandshake(format!(
                    "Malformed header line: {}",
                    line
                )));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::InvalidHandshake("Empty header name".into()));
            }
            headers.append(name, value.trim());
        }

        Ok(Self {
            method: (*method).to_string(),
            uri: (*uri).to_string(),
            version: (*version).to_string(),
            headers,
        })
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Every value of a header, case-insensitive.
    pub fn headers_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.headers.get_all(name)
    }

    /// Check the upgrade requirements and return the client's key.
    ///
    /// The minimal contract is `Upgrade: websocket` (exact value) and a
    /// non-empty `Sec-WebSocket-Key`. With `strict` the request must also be
    /// a `GET` over HTTP/1.1 carrying `Connection: upgrade`,
    /// `Sec-WebSocket-Version: 13` and a key that decodes to 16 bytes.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::MissingUpgrade`] if the Upgrade header is absent or
    ///   is not exactly `websocket`
    /// - [`HandshakeError::MissingKey`] if the key is absent or empty
    /// - [`HandshakeError::Malformed`] if a strict check fails
    pub fn validate(&self, strict: bool) -> std::result::Result<&str, HandshakeError> {
        if self.header("Upgrade") != Some("websocket") {
            return Err(HandshakeError::MissingUpgrade);
        }

        let key = match self.header("Sec-WebSocket-Key") {
            Some(key) if !key.is_empty() => key,
            _ => return Err(HandshakeError::MissingKey),
        };

        if strict {
            self.validate_strict(key)?;
        }

        Ok(key)
    }

    fn validate_strict(&self, key: &str) -> std::result::Result<(), HandshakeError> {
        if self.method != "GET" {
            return Err(HandshakeError::Malformed(format!(
                "Expected GET method, got {}",
                self.method
            )));
        }

        if self.version != "HTTP/1.1" {
            return Err(HandshakeError::Malformed(format!(
                "Expected HTTP/1.1, got {}",
                self.version
            )));
        }

        let has_upgrade_token = self
            .headers_all("Connection")
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !has_upgrade_token {
            return Err(HandshakeError::Malformed(
                "Connection header does not contain upgrade".into(),
            ));
        }

        match self.header("Sec-WebSocket-Version") {
            Some("13") => {}
            Some(other) => {
                return Err(HandshakeError::Malformed(format!(
                    "Unsupported WebSocket version: {} (expected 13)",
                    other
                )));
            }
            None => {
                return Err(HandshakeError::Malformed(
                    "Missing Sec-WebSocket-Version header".into(),
                ));
            }
        }

        match BASE64.decode(key) {
            Ok(decoded) if decoded.len() == 16 => Ok(()),
            Ok(decoded) => Err(HandshakeError::Malformed(format!(
                "Sec-WebSocket-Key must be 16 bytes, got {}",
                decoded.len()
            ))),
            Err(_) => Err(HandshakeError::Malformed(
                "Invalid Sec-WebSocket-Key: not valid Base64".into(),
            )),
        }
    }
}

/// The 101 Switching Protocols response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept value.
    pub accept: String,
}

impl HandshakeResponse {
    pub fn for_key(key: &str) -> Self {
        Self {
            accept: compute_accept_key(key),
        }
    }

    /// Write the response. Exactly these four header lines, nothing else.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(b"Sec-WebSocket-Accept: ");
        buf.extend_from_slice(self.accept.as_bytes());
        buf.extend_from_slice(b"\r\n\r\n");
    }
}

/// Write a plain HTTP error response that closes the connection.
pub fn write_error_response(status: u16, body: &str, buf: &mut Vec<u8>) {
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    };
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        )
        .as_bytes(),
    );
}

impl HandshakeError {
    /// Write the HTTP rejection for this error.
    pub fn write_response(&self, buf: &mut Vec<u8>) {
        write_error_response(self.status(), &self.to_string(), buf);
    }
}

/// An HTTP connection that can give up its raw byte stream.
///
/// After a successful `hijack` the HTTP layer no longer touches the stream;
/// everything written or read from then on belongs to the WebSocket.
pub trait Hijacker {
    type Io;

    fn hijack(self) -> io::Result<Self::Io>;
}

/// Complete the opening handshake and return an open connection.
///
/// Steps, in order: validate the request (400 on failure), take over the
/// stream (500 if the HTTP layer cannot or fails to), write and flush the
/// 101 response. No frame is exchanged before the flush completes. The
/// client key is not retained.
///
/// # Errors
///
/// See [`HandshakeError`]; [`HandshakeError::status`] gives the HTTP status
/// the caller should answer with when the stream is still available.
pub async fn accept<H>(
    request: &HandshakeRequest,
    hijacker: Option<H>,
    config: Config,
) -> std::result::Result<WebSocket<H::Io>, HandshakeError>
where
    H: Hijacker,
    H::Io: AsyncRead + AsyncWrite + Unpin,
{
    let key = request.validate(config.strict_handshake).inspect_err(|err| {
        debug!(uri = %request.uri, error = %err, "rejecting upgrade request");
    })?;
    let response = HandshakeResponse::for_key(key);

    let hijacker = hijacker.ok_or(HandshakeError::HijackUnsupported)?;
    let mut io = hijacker
        .hijack()
        .map_err(|err| HandshakeError::HijackFailed(err.to_string()))?;

    let mut buf = Vec::with_capacity(128);
    response.write(&mut buf);
    io.write_all(&buf)
        .await
        .map_err(|err| HandshakeError::Io(err.to_string()))?;
    io.flush()
        .await
        .map_err(|err| HandshakeError::Io(err.to_string()))?;

    info!(uri = %request.uri, "websocket handshake complete");
    Ok(WebSocket::from_upgraded(io, config))
}
