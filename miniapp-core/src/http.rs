//! HTTP-shaped bootstrap wire format and response framing.
//!
//! Requests are plain `GET`s serialized to bytes; responses arrive as an arbitrary number of
//! channel messages and are reassembled until a [`ResponseFraming`] reports them complete.

use std::fmt;

pub const HEADER_IF_NONE_MATCH: &str = "If-None-Match";
pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_MODIFIED: u16 = 304;

const MAX_HEADERS: usize = 32;
const CATALOG_PATH: &str = "/applicationlist";
const BINARY_PATH: &str = "/applications";

/// Outgoing bootstrap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Catalog page request.
    pub fn catalog(begin_index: usize, app_num: usize, sdk_version: &str) -> Self {
        Self::get(format!(
            "{CATALOG_PATH}?begin-index={begin_index}&app-num={app_num}&sdkVersion={sdk_version}"
        ))
    }

    /// Binary request, conditional on the etag already installed locally.
    pub fn binary(app_id: &str, sdk_version: &str, if_none_match: Option<&str>) -> Self {
        let req = Self::get(format!("{BINARY_PATH}?appid={app_id}&sdkVersion={sdk_version}"));
        match if_none_match {
            Some(etag) => req.with_header(HEADER_IF_NONE_MATCH, etag),
            None => req,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Parse a serialized request. Used by peers and test doubles answering the bootstrap channel.
    pub fn decode(bytes: &[u8]) -> Result<Self, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        if req.parse(bytes)?.is_partial() {
            return Err(HttpError::Incomplete);
        }
        Ok(Self {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            headers: collect_headers(req.headers),
        })
    }

    /// Value of a query parameter in the path.
    pub fn query(&self, key: &str) -> Option<&str> {
        let (_, query) = self.path.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Decoded bootstrap response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// ETag with surrounding quotes removed; `None` when absent or blank.
    pub fn etag(&self) -> Option<&str> {
        self.header(HEADER_ETAG)
            .map(|v| v.trim_matches('"'))
            .filter(|v| !v.is_empty())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode a complete response buffer. The body is cut to `Content-Length` when present.
    pub fn decode(bytes: &[u8]) -> Result<Self, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let header_len = match resp.parse(bytes)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Err(HttpError::Incomplete),
        };
        let status = resp.code.ok_or(HttpError::Incomplete)?;
        let headers = collect_headers(resp.headers);
        let mut body = bytes[header_len..].to_vec();
        if let Some(len) = content_length(&headers)? {
            if body.len() < len {
                return Err(HttpError::Truncated {
                    expected: len,
                    actual: body.len(),
                });
            }
            body.truncate(len);
        }
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Serialize with a `Content-Length` header added when missing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if self.header(HEADER_CONTENT_LENGTH).is_none() {
            head.push_str(&format!("{HEADER_CONTENT_LENGTH}: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        404 => "Not Found",
        _ => "Unknown",
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, HttpError> {
    match find_header(headers, HEADER_CONTENT_LENGTH) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| HttpError::BadContentLength(v.to_string())),
        None => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("http parse error: {0}")]
    Parse(#[from] httparse::Error),
    #[error("incomplete http message")]
    Incomplete,
    #[error("invalid Content-Length: {0}")]
    BadContentLength(String),
    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Result of inspecting a partially received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Incomplete { percent: u8 },
    Complete,
}

/// Decides when an accumulated response buffer is complete.
pub trait ResponseFraming: Send + Sync + fmt::Debug {
    fn check(&self, buf: &[u8]) -> Completeness;

    /// Bytes handed to the decoder once `check` reports complete.
    fn strip<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf
    }
}

/// Header block ends at CRLFCRLF; the body is `Content-Length` bytes long.
///
/// A malformed header block counts as complete so the decoder can report it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentLengthFraming;

impl ResponseFraming for ContentLengthFraming {
    fn check(&self, buf: &[u8]) -> Completeness {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let header_len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Completeness::Incomplete { percent: 0 },
            Err(_) => return Completeness::Complete,
        };
        let headers = collect_headers(resp.headers);
        let total = match content_length(&headers) {
            Ok(Some(total)) => total,
            Ok(None) | Err(_) => return Completeness::Complete,
        };
        let received = buf.len() - header_len;
        if received >= total {
            Completeness::Complete
        } else {
            let percent = (received as u64 * 100 / total as u64).min(99) as u8;
            Completeness::Incomplete { percent }
        }
    }
}

/// Response ends with a fixed terminator, which is stripped before decoding.
#[derive(Debug, Clone)]
pub struct TerminatorFraming {
    terminator: Vec<u8>,
}

impl TerminatorFraming {
    pub fn new(terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            terminator: terminator.into(),
        }
    }
}

impl ResponseFraming for TerminatorFraming {
    fn check(&self, buf: &[u8]) -> Completeness {
        if !self.terminator.is_empty() && buf.ends_with(&self.terminator) {
            Completeness::Complete
        } else {
            Completeness::Incomplete { percent: 0 }
        }
    }

    fn strip<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.strip_suffix(self.terminator.as_slice()).unwrap_or(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_request_bytes() {
        let req = HttpRequest::catalog(20, 20, "1.0");
        assert_eq!(
            req.to_bytes(),
            b"GET /applicationlist?begin-index=20&app-num=20&sdkVersion=1.0 HTTP/1.1\r\n\r\n"
        );
    }

    #[test]
    fn binary_request_carries_etag() {
        let req = HttpRequest::binary("weather", "1.0", Some("v3"));
        let decoded = HttpRequest::decode(&req.to_bytes()).unwrap();
        assert_eq!(decoded.path(), "/applications?appid=weather&sdkVersion=1.0");
        assert_eq!(decoded.header("if-none-match"), Some("v3"));
        assert_eq!(decoded.query("appid"), Some("weather"));
        assert!(HttpRequest::binary("weather", "1.0", None)
            .header(HEADER_IF_NONE_MATCH)
            .is_none());
    }

    #[test]
    fn decode_response_cuts_body_to_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nETag: \"abc\"\r\nContent-Length: 3\r\n\r\nzipEXTRA";
        let resp = HttpResponse::decode(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.etag(), Some("abc"));
        assert_eq!(resp.body, b"zip");
    }

    #[test]
    fn decode_rejects_short_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            HttpResponse::decode(raw),
            Err(HttpError::Truncated { expected: 10, actual: 3 })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(HttpResponse::decode(b"\x00\x01garbage\r\n\r\n").is_err());
    }

    #[test]
    fn content_length_framing_reports_progress() {
        let full = HttpResponse::new(200).with_body(vec![7u8; 100]).to_bytes();
        let framing = ContentLengthFraming;
        let header_len = full.len() - 100;
        assert_eq!(
            framing.check(&full[..10]),
            Completeness::Incomplete { percent: 0 }
        );
        assert_eq!(
            framing.check(&full[..header_len + 40]),
            Completeness::Incomplete { percent: 40 }
        );
        assert_eq!(framing.check(&full), Completeness::Complete);
    }

    #[test]
    fn not_modified_without_body_is_complete() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nETag: v1\r\n\r\n";
        assert_eq!(ContentLengthFraming.check(raw), Completeness::Complete);
    }

    #[test]
    fn terminator_framing_strips_suffix() {
        let framing = TerminatorFraming::new(b"\0\0".to_vec());
        let mut buf = HttpResponse::new(200).with_body("x").to_bytes();
        assert!(matches!(framing.check(&buf), Completeness::Incomplete { .. }));
        buf.extend_from_slice(b"\0\0");
        assert_eq!(framing.check(&buf), Completeness::Complete);
        let resp = HttpResponse::decode(framing.strip(&buf)).unwrap();
        assert_eq!(resp.body, b"x");
    }
}
