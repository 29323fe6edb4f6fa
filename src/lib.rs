//! # muxrpc
//!
//! A from-scratch async server framework that multiplexes logical
//! request/response streams over TCP, HTTP/2-style, with per-stream and
//! per-connection flow control, exact-path request routing, and JSON-RPC
//! method dispatch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use muxrpc::http::{Response, StatusCode};
//! use muxrpc::pool::EventLoopPool;
//! use muxrpc::rpc::{RpcError, Service};
//! use muxrpc::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = Arc::new(EventLoopPool::new(4));
//!     pool.start();
//!
//!     let mut service = Service::new();
//!     service.register("add", |(a, b): (i64, i64)| async move {
//!         Ok::<_, RpcError>(a + b)
//!     });
//!
//!     let mut server = Server::new(Arc::clone(&pool));
//!     server.register_handler("/ping", |_req| async {
//!         Ok(Response::new(StatusCode::Ok).body("pong"))
//!     });
//!     server.register_service("/rpc", service);
//!
//!     server.listen_and_serve("127.0.0.1", 4600).await?;
//!     Ok(())
//! }
//! ```

pub mod conn;
pub mod frame;
pub mod http;
pub mod listener;
pub mod mux;
pub mod pool;
pub mod rpc;
pub mod server;
pub mod stream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use conn::{Connection, ConnectionError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use listener::{Listener, ListenerError};
pub use mux::RequestMux;
pub use pool::EventLoopPool;
pub use rpc::{ErrorCode, RpcError, RpcRequest, RpcResponse, Service};
pub use server::{Server, ServerConfig, ServerError};
pub use stream::{FlowConfig, FlowWindow, Stream, StreamError, StreamState};
