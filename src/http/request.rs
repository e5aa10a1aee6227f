//! Request head decoding.
//!
//! # Responsibilities
//! - Read exactly one HTTP/1.x request head off the client stream
//! - Enforce the head size limit before parsing
//! - Resolve the origin host and port from the request-target
//! - Determine how the request body is framed
//!
//! # Design Decisions
//! - The head is kept byte-for-byte so it can be forwarded unmodified
//! - Bytes after the head stay in the caller's buffered reader
//! - Parsing is delegated to `httparse`; this module only interprets it

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Maximum number of header fields accepted in a request head.
pub const MAX_HEADERS: usize = 64;

/// Default port for CONNECT targets without one.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Default port for plain HTTP targets without one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("connection closed before a request was sent")]
    ConnectionClosed,

    #[error("connection closed mid-way through the request head")]
    Incomplete,

    #[error("request head not received within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("invalid request target '{0}'")]
    InvalidTarget(String),

    #[error("request has no target host")]
    MissingHost,

    #[error("invalid Content-Length '{0}'")]
    InvalidContentLength(String),

    #[error("unsupported Transfer-Encoding '{0}'")]
    UnsupportedTransferEncoding(String),

    #[error("read request: {0}")]
    Io(#[from] std::io::Error),
}

/// How the request body following the head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding, terminated by a zero-size chunk and trailers.
    Chunked,
}

/// One decoded request head. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Request method, case preserved.
    pub method: String,
    /// Raw request-target.
    pub target: String,
    /// Origin host; IPv6 literals without brackets.
    pub host: String,
    /// Origin port with the per-method default already applied.
    pub port: u16,
    /// Protocol version as sent, e.g. `HTTP/1.1`.
    pub version: String,
    /// Body framing. Always `None` for CONNECT.
    pub framing: BodyFraming,
    /// The full head exactly as received, terminating blank line included.
    pub head: Vec<u8>,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Reads request heads with a bounded size.
#[derive(Debug, Clone, Copy)]
pub struct RequestDecoder {
    max_header_bytes: usize,
}

impl RequestDecoder {
    pub fn new(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }

    /// Read and decode one request head from `reader`.
    ///
    /// Consumes exactly the head; any body bytes remain buffered in `reader`.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<ParsedRequest, DecodeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let head = self.read_head(reader).await?;
        parse_head(head)
    }

    async fn read_head<R>(&self, reader: &mut R) -> Result<Vec<u8>, DecodeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = Vec::with_capacity(1024);
        loop {
            let remaining = self.max_header_bytes.saturating_sub(head.len());
            if remaining == 0 {
                return Err(DecodeError::HeadTooLarge(self.max_header_bytes));
            }

            let line_start = head.len();
            let n = (&mut *reader)
                .take(remaining as u64)
                .read_until(b'\n', &mut head)
                .await?;
            if n == 0 {
                return Err(if head.is_empty() {
                    DecodeError::ConnectionClosed
                } else {
                    DecodeError::Incomplete
                });
            }
            if !head.ends_with(b"\n") {
                // Hit the size limit mid-line; the next pass reports it.
                continue;
            }

            let line = &head[line_start..];
            let blank = line == b"\r\n" || line == b"\n";
            if blank && line_start == 0 {
                // Tolerate stray empty lines ahead of the request line.
                head.clear();
                continue;
            }
            if blank {
                return Ok(head);
            }
        }
    }
}

fn parse_head(head: Vec<u8>) -> Result<ParsedRequest, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(&head)?.is_partial() {
        return Err(DecodeError::Incomplete);
    }

    // A complete parse always carries these three.
    let (Some(method), Some(target), Some(minor)) = (req.method, req.path, req.version) else {
        return Err(DecodeError::Incomplete);
    };
    let method = method.to_string();
    let target = target.to_string();
    let version = format!("HTTP/1.{minor}");

    let (host, port, framing) = if method == "CONNECT" {
        let (host, port) = split_authority(&target)?;
        (host, port.unwrap_or(DEFAULT_TUNNEL_PORT), BodyFraming::None)
    } else {
        let (host, port) = resolve_origin(&target, req.headers)?;
        (host, port, body_framing(req.headers)?)
    };

    Ok(ParsedRequest {
        method,
        target,
        host,
        port,
        version,
        framing,
        head,
    })
}

/// Host and port for a non-CONNECT request: absolute-form target first,
/// then the `Host` header.
fn resolve_origin(target: &str, headers: &[httparse::Header<'_>]) -> Result<(String, u16), DecodeError> {
    if is_absolute_form(target) {
        let url = url::Url::parse(target).map_err(|_| DecodeError::InvalidTarget(target.to_string()))?;
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(DecodeError::MissingHost),
        };
        let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
        return Ok((host, port));
    }

    let host_header = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .ok_or(DecodeError::MissingHost)?;
    let value = std::str::from_utf8(host_header.value)
        .map_err(|_| DecodeError::InvalidTarget(String::from_utf8_lossy(host_header.value).into_owned()))?
        .trim();
    let (host, port) = split_authority(value)?;
    Ok((host, port.unwrap_or(DEFAULT_HTTP_PORT)))
}

/// `scheme://...`; origin-form paths may carry `://` in their query.
fn is_absolute_form(target: &str) -> bool {
    match target.split_once("://") {
        Some((scheme, _)) => {
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Split `host[:port]` / `[v6][:port]`. An empty port counts as absent.
pub fn split_authority(authority: &str) -> Result<(String, Option<u16>), DecodeError> {
    let invalid = || DecodeError::InvalidTarget(authority.to_string());

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    // Unbracketed colons only make sense as an IPv6 literal, which needs brackets.
    if host.is_empty() || (host.contains(':') && !authority.starts_with('[')) {
        return Err(invalid());
    }
    if host.contains(['/', '?', '#', '@', ' ']) {
        return Err(invalid());
    }

    let port = match port {
        None | Some("") => None,
        Some(p) if is_digits(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
        Some(_) => return Err(invalid()),
    };

    // Normalise dotted quads the same way the URL path does.
    let host = match host.parse::<Ipv4Addr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => host.to_string(),
    };
    Ok((host, port))
}

fn body_framing(headers: &[httparse::Header<'_>]) -> Result<BodyFraming, DecodeError> {
    let mut transfer_encoding: Option<String> = None;
    let mut content_length: Option<u64> = None;

    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            let last = value.rsplit(',').next().unwrap_or("").trim().to_ascii_lowercase();
            transfer_encoding = Some(last);
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let raw = String::from_utf8_lossy(header.value);
            for part in raw.split(',').map(str::trim) {
                // `u64::from_str` takes a leading `+`; origins may not.
                if !is_digits(part) {
                    return Err(DecodeError::InvalidContentLength(raw.to_string()));
                }
                let length = part
                    .parse::<u64>()
                    .map_err(|_| DecodeError::InvalidContentLength(raw.to_string()))?;
                match content_length {
                    Some(seen) if seen != length => {
                        return Err(DecodeError::InvalidContentLength(raw.to_string()))
                    }
                    _ => content_length = Some(length),
                }
            }
        }
    }

    // Transfer-Encoding overrides Content-Length.
    match (transfer_encoding, content_length) {
        (Some(coding), _) if coding == "chunked" => Ok(BodyFraming::Chunked),
        (Some(coding), _) => Err(DecodeError::UnsupportedTransferEncoding(coding)),
        (None, Some(0)) | (None, None) => Ok(BodyFraming::None),
        (None, Some(length)) => Ok(BodyFraming::Length(length)),
    }
}
