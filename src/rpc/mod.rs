//! Named, typed remote methods with JSON-RPC-compatible error semantics.
//!
//! A [`Service`] owns a table mapping method names to typed async
//! callables. Registration happens before the service starts dispatching;
//! afterwards the table is read-only, so concurrent calls on different
//! workers need no locking.
//!
//! Dispatch decodes a call envelope (method, params, correlation id), runs
//! the matching method, and encodes the typed result — or a structured
//! error from the fixed taxonomy — back against the same id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::http::{Request, Response, StatusCode};
use crate::mux::{Handler, HandlerError};

/// The fixed JSON-RPC error taxonomy, plus an open range for
/// application-defined codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The call body was not parseable at all (-32700).
    ParseError,
    /// The body parsed but is not a valid call envelope (-32600).
    InvalidRequest,
    /// No method with the requested name is registered (-32601).
    MethodNotFound,
    /// Parameters do not match the method's signature (-32602).
    InvalidParams,
    /// The method body failed (-32603).
    InternalError,
    /// Generic server-side failure (-32000).
    ServerError,
    /// An application-defined code outside the reserved range.
    Application(i32),
}

impl ErrorCode {
    /// Returns the numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::Application(code) => code,
        }
    }

    /// Returns the canonical message for codes in the fixed taxonomy.
    pub fn canonical_message(self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams => "InvalidParams",
            Self::InternalError => "InternalError",
            Self::ServerError => "ServerError",
            Self::Application(_) => "ApplicationError",
        }
    }
}

/// A structured `(code, message)` RPC error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    /// Builds an error carrying the canonical message for `code`.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.canonical_message().to_owned(),
        }
    }

    /// Builds an error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A decoded call envelope: method name, parameters, correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    /// Builds a call envelope.
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }
}

/// A call result serialized against its correlation id.
///
/// Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    /// A successful response carrying `result`.
    pub fn success(result: Value, id: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    /// A failed response carrying a structured error.
    pub fn failure(error: RpcError, id: Value) -> Self {
        Self {
            result: None,
            error: Some(error),
            id,
        }
    }
}

type Method =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>> + Send + Sync>;

/// A registry of named, typed remote methods.
///
/// # Examples
///
/// ```
/// use muxrpc::rpc::{RpcError, Service};
///
/// let mut service = Service::new();
/// service.register("add", |(a, b): (i64, i64)| async move {
///     Ok::<_, RpcError>(a + b)
/// });
/// ```
#[derive(Clone, Default)]
pub struct Service {
    methods: HashMap<String, Method>,
}

impl Service {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed async method under `name`.
    ///
    /// Parameters are deserialized from the envelope's `params` value; a
    /// shape mismatch produces `InvalidParams` without invoking the method.
    /// The method's `Ok` value is serialized as the call result; its `Err`
    /// flows back unchanged, so application codes survive dispatch.
    ///
    /// Methods cannot be unregistered, and registration must finish before
    /// dispatch begins — the table is read-only at call time.
    pub fn register<P, R, F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        P: DeserializeOwned + Send,
        R: Serialize,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let method = Arc::new(method);
        let erased: Method = Arc::new(move |params: Value| {
            let method = Arc::clone(&method);
            Box::pin(async move {
                let params: P = serde_json::from_value(params).map_err(|e| {
                    RpcError::with_message(ErrorCode::InvalidParams, e.to_string())
                })?;
                let result = method(params).await?;
                serde_json::to_value(result)
                    .map_err(|_| RpcError::new(ErrorCode::InternalError))
            })
        });
        self.methods.insert(name.into(), erased);
    }

    /// Returns the number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Decodes a raw call body, dispatches it, and produces the response
    /// envelope.
    ///
    /// Error mapping: unparsable body → `ParseError`; valid JSON that is
    /// not a call envelope → `InvalidRequest`; unknown method →
    /// `MethodNotFound`; the rest per [`Service::register`].
    pub async fn dispatch(&self, body: &[u8]) -> RpcResponse {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "unparsable rpc body");
                return RpcResponse::failure(RpcError::new(ErrorCode::ParseError), Value::Null);
            }
        };

        // Keep the correlation id for the error response even when the
        // envelope is otherwise malformed.
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        let call: RpcRequest = match serde_json::from_value(value) {
            Ok(call) => call,
            Err(e) => {
                debug!(error = %e, "malformed rpc envelope");
                return RpcResponse::failure(RpcError::new(ErrorCode::InvalidRequest), id);
            }
        };

        self.call(call).await
    }

    /// Dispatches an already-decoded envelope.
    pub async fn call(&self, call: RpcRequest) -> RpcResponse {
        let RpcRequest { method, params, id } = call;

        let Some(callable) = self.methods.get(&method) else {
            debug!(method = %method, "rpc method not found");
            return RpcResponse::failure(RpcError::new(ErrorCode::MethodNotFound), id);
        };

        match callable(params).await {
            Ok(result) => RpcResponse::success(result, id),
            Err(e) => {
                error!(method = %method, code = e.code, error = %e.message, "rpc method failed");
                RpcResponse::failure(e, id)
            }
        }
    }

    /// Adapts this service into a mux [`Handler`] so it can be mounted at a
    /// path: the request body is the call envelope, the response body the
    /// serialized result envelope.
    pub fn into_handler(self) -> Handler {
        let service = Arc::new(self);
        Arc::new(move |request: Request| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                let rpc_response = service.dispatch(request.body()).await;
                let body = serde_json::to_vec(&rpc_response)
                    .map_err(|e| Box::new(e) as HandlerError)?;
                Ok(Response::new(StatusCode::Ok)
                    .header("Content-Type", "application/json")
                    .body_bytes(body))
            })
        })
    }
}
