//! Request value object and its wire head.
//!
//! A [`Request`] is immutable once built. The demux layer assembles one from
//! a decoded [`RequestHead`] plus the concatenated DATA payloads of its
//! stream; clients and tests build one with the fluent constructor methods
//! and serialize the head for a HEADERS frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Headers, Method, PROTOCOL_VERSION};

/// Errors produced while encoding or decoding a request head.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u8 },
}

/// The structured payload of a request HEADERS frame.
///
/// Everything about a request except its body. Serialized with serde into
/// the frame payload; the body follows as DATA frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    /// Serializes the head for transmission in a HEADERS frame.
    pub fn encode(&self) -> Result<Bytes, HeadError> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Decodes a head from a HEADERS frame payload.
    ///
    /// # Errors
    ///
    /// - [`HeadError::Malformed`] — the payload is not a valid head.
    /// - [`HeadError::UnsupportedVersion`] — the peer speaks a protocol
    ///   version this endpoint does not.
    pub fn decode(payload: &[u8]) -> Result<Self, HeadError> {
        let head: Self = serde_json::from_slice(payload)?;
        if head.version != PROTOCOL_VERSION {
            return Err(HeadError::UnsupportedVersion {
                version: head.version,
            });
        }
        Ok(head)
    }
}

/// A request, immutable once built.
///
/// # Examples
///
/// ```
/// use muxrpc::http::{Method, Request};
///
/// let request = Request::new(Method::Post, "/rpc")
///     .header("Content-Type", "application/json")
///     .with_body(r#"{"method":"ping","id":1}"#);
///
/// assert_eq!(request.path(), "/rpc");
/// assert_eq!(request.headers().get("content-type"), Some("application/json"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Starts a new request with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: PROTOCOL_VERSION,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body from a string.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into().into_bytes());
        self
    }

    /// Sets the request body from raw bytes.
    #[must_use]
    pub fn with_body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Reassembles a request from a decoded head and its collected body.
    pub fn from_head(head: RequestHead, body: Bytes) -> Self {
        // Method parsing is infallible: unknown strings become Custom.
        let method = head.method.parse().unwrap_or(Method::Get);
        Self {
            method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            body,
        }
    }

    /// Returns the wire head for this request.
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.as_str().to_owned(),
            path: self.path.clone(),
            version: self.version,
            headers: self.headers.clone(),
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the protocol version this request was sent with.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let req = Request::new(Method::Post, "/rpc")
            .header("Content-Type", "application/json")
            .with_body("hello");
        let encoded = req.head().encode().unwrap();
        let head = RequestHead::decode(&encoded).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/rpc");
        assert_eq!(head.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn builder_sets_body_readable_through_accessor() {
        let req = Request::new(Method::Post, "/x").with_body("payload");
        assert_eq!(&req.body()[..], b"payload");

        let req = Request::new(Method::Post, "/x").with_body_bytes(Bytes::from_static(b"raw"));
        assert_eq!(&req.body()[..], b"raw");
    }

    #[test]
    fn from_head_rebuilds_request() {
        let head = RequestHead {
            method: "GET".to_owned(),
            path: "/status".to_owned(),
            version: PROTOCOL_VERSION,
            headers: Headers::new(),
        };
        let req = Request::from_head(head, Bytes::from_static(b"body"));
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/status");
        assert_eq!(&req.body()[..], b"body");
    }

    #[test]
    fn version_mismatch_rejected() {
        let head = RequestHead {
            method: "GET".to_owned(),
            path: "/".to_owned(),
            version: PROTOCOL_VERSION + 1,
            headers: Headers::new(),
        };
        let encoded = head.encode().unwrap();
        assert!(matches!(
            RequestHead::decode(&encoded),
            Err(HeadError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn malformed_head_rejected() {
        assert!(matches!(
            RequestHead::decode(b"not json"),
            Err(HeadError::Malformed(_))
        ));
    }
}
