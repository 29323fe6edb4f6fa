//! Response builder and its wire head.
//!
//! Handlers build a [`Response`] incrementally with the fluent API; the
//! serving loop splits it into a [`ResponseHead`] (sent in a HEADERS frame)
//! and a body (sent as flow-controlled DATA frames).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::request::HeadError;
use super::{Headers, StatusCode};

/// The structured payload of a response HEADERS frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    /// Serializes the head for transmission in a HEADERS frame.
    pub fn encode(&self) -> Result<Bytes, HeadError> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Decodes a head from a HEADERS frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HeadError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Returns the typed status code, or `None` for codes outside the
    /// supported set.
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status)
    }
}

/// A response, built incrementally by a handler.
///
/// # Examples
///
/// ```
/// use muxrpc::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place, for code that receives a `Response` and
    /// decorates it without consuming it.
    pub fn add_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Splits the response into its wire head and body.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` when the body is
    /// non-empty and no content type was set.
    pub fn into_parts(mut self) -> (ResponseHead, Bytes) {
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        (
            ResponseHead {
                status: self.status.as_u16(),
                headers: self.headers,
            },
            Bytes::from(self.body),
        )
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_carry_status_and_body() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let (head, body) = r.into_parts();
        assert_eq!(head.status, 200);
        assert_eq!(head.status(), Some(StatusCode::Ok));
        assert_eq!(&body[..], b"Hello");
    }

    #[test]
    fn default_content_type_added() {
        let (head, _) = Response::new(StatusCode::Ok).body("x").into_parts();
        assert_eq!(
            head.headers.get("content-type"),
            Some("text/plain; charset=utf-8")
        );
    }

    #[test]
    fn empty_body_gets_no_content_type() {
        let (head, body) = Response::new(StatusCode::NoContent).into_parts();
        assert!(!head.headers.contains("content-type"));
        assert!(body.is_empty());
    }

    #[test]
    fn head_round_trip() {
        let (head, _) = Response::new(StatusCode::NotFound)
            .header("X-Request-Id", "abc-123")
            .body("nope")
            .into_parts();
        let encoded = head.encode().unwrap();
        let back = ResponseHead::decode(&encoded).unwrap();
        assert_eq!(back.status, 404);
        assert_eq!(back.headers.get("x-request-id"), Some("abc-123"));
    }
}
