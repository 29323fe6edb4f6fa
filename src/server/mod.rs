//! Server lifecycle: listener + event-loop pool + stream demultiplexing.
//!
//! [`Server::listen_and_serve`] binds a listener and accepts connections
//! until [`shutdown`](Server::shutdown) is called. Each accepted
//! [`Connection`] is handed to the [`EventLoopPool`], where a single task
//! owns it exclusively: incoming frames are demultiplexed into streams,
//! each completed request is dispatched through the [`RequestMux`], and the
//! response is written back on the same stream as a HEADERS frame plus
//! flow-controlled DATA frames.
//!
//! Error locality: an I/O or protocol failure on one connection closes that
//! connection only; a flow-control violation resets the offending stream.
//! The server and every other connection keep running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::conn::{Connection, ConnectionError};
use crate::frame::{Frame, FrameType, reset_code};
use crate::http::request::RequestHead;
use crate::http::Request;
use crate::listener::{Listener, ListenerError};
use crate::mux::{IntoHandler, RequestMux};
use crate::pool::EventLoopPool;
use crate::rpc::Service;
use crate::stream::{FlowConfig, FlowWindow, Stream, StreamError};

/// Largest DATA payload sent in one frame.
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Default cap on a complete buffered request body (8 MiB).
pub const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Errors returned by the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("server is already running")]
    AlreadyRunning,
}

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Flow-control settings applied to every connection and stream.
    pub flow: FlowConfig,
    /// Largest complete request body accepted on one stream. A stream
    /// whose accumulated body exceeds this is reset; credit replenishment
    /// alone does not bound what a peer can make this endpoint buffer.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            max_request_size: MAX_REQUEST_SIZE,
        }
    }
}

/// A serving endpoint composing a [`Listener`], an [`EventLoopPool`], and a
/// [`RequestMux`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use muxrpc::http::{Response, StatusCode};
/// use muxrpc::pool::EventLoopPool;
/// use muxrpc::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = Arc::new(EventLoopPool::new(4));
///     pool.start();
///
///     let mut server = Server::new(Arc::clone(&pool));
///     server.register_handler("/ping", |_req| async {
///         Ok(Response::new(StatusCode::Ok).body("pong"))
///     });
///
///     Arc::new(server).listen_and_serve("127.0.0.1", 4600).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    pool: Arc<EventLoopPool>,
    mux: RequestMux,
    config: ServerConfig,
    running: AtomicBool,
    stopping: AtomicBool,
    shutdown: Notify,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    /// Creates a server with default configuration and an empty mux.
    pub fn new(pool: Arc<EventLoopPool>) -> Self {
        Self::with_config(pool, ServerConfig::default())
    }

    /// Creates a server with explicit configuration.
    pub fn with_config(pool: Arc<EventLoopPool>, config: ServerConfig) -> Self {
        Self {
            pool,
            mux: RequestMux::new(),
            config,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Registers an exact-path handler. Must be called before
    /// [`listen_and_serve`](Self::listen_and_serve); the routing table is
    /// read-only while serving.
    pub fn register_handler(&mut self, path: &str, handler: impl IntoHandler) {
        self.mux.handle(path, handler);
    }

    /// Mounts an RPC [`Service`] at `path`.
    pub fn register_service(&mut self, path: &str, service: Service) {
        let handler = service.into_handler();
        self.mux.handle(path, move |req| {
            let handler = Arc::clone(&handler);
            async move { handler(req).await }
        });
    }

    /// Returns `true` while the server is accepting connections.
    ///
    /// Safe to call from any thread at any time.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the bound local address once serving has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Requests shutdown. Idempotent: repeated calls, or calls on a server
    /// that never started, return immediately with no further effect.
    /// `is_running` is false by the time this returns.
    pub fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
        self.running.store(false, Ordering::Release);
    }

    /// Binds `host:port` and serves until [`shutdown`](Self::shutdown).
    ///
    /// Bind failures are returned synchronously and never retried; retry
    /// policy belongs to the caller.
    pub async fn listen_and_serve(&self, host: &str, port: u16) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }
        if self.stopping.load(Ordering::Acquire) {
            self.running.store(false, Ordering::Release);
            return Ok(());
        }

        let mut listener = Listener::new(host, port);
        if let Err(e) = listener.start().await {
            self.running.store(false, Ordering::Release);
            return Err(e.into());
        }
        if let Some(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        info!(address = ?listener.local_addr(), "muxrpc serving");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(ListenerError::Closed) => break,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    let peer = conn.peer_addr();
                    let mux = Arc::new(self.mux.clone());
                    let config = self.config.clone();
                    let spawned = self.pool.spawn(async move {
                        if let Err(e) = serve_connection(conn, peer, mux, config).await {
                            warn!(peer = %peer, error = %e, "connection closed with error");
                        }
                        Ok(())
                    });
                    if spawned.is_err() {
                        warn!("event loop pool stopped; shutting down");
                        break;
                    }
                }
            }
        }

        listener.close();
        self.running.store(false, Ordering::Release);
        info!("muxrpc stopped");
        Ok(())
    }
}

// Per-stream assembly state while a request is arriving or a response body
// is waiting for outbound credit.
struct StreamEntry {
    stream: Stream,
    head: Option<RequestHead>,
    body: BytesMut,
    pending: Bytes,
}

impl StreamEntry {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            head: None,
            body: BytesMut::new(),
            pending: Bytes::new(),
        }
    }
}

/// Demultiplexes one connection until the peer hangs up or a fatal
/// connection error occurs.
async fn serve_connection(
    mut conn: Connection,
    peer: SocketAddr,
    mux: Arc<RequestMux>,
    config: ServerConfig,
) -> Result<(), ConnectionError> {
    let flow = &config.flow;
    let mut conn_inbound = FlowWindow::new(flow.initial_connection_window, flow.max_window);
    let mut conn_outbound = FlowWindow::new(flow.initial_connection_window, flow.max_window);
    let mut conn_consumed: u32 = 0;
    let mut streams: HashMap<u32, StreamEntry> = HashMap::new();
    let mut last_stream_id: u32 = 0;

    while let Some(frame) = conn.read_frame().await? {
        match frame.kind {
            FrameType::Headers => {
                // Stream ids are peer-assigned, non-zero, strictly increasing.
                if frame.stream_id == 0 || frame.stream_id <= last_stream_id {
                    warn!(peer = %peer, stream_id = frame.stream_id, "stream id not increasing");
                    conn.write_frame(&Frame::reset(frame.stream_id, reset_code::PROTOCOL_ERROR))
                        .await?;
                    continue;
                }
                last_stream_id = frame.stream_id;

                let head = match RequestHead::decode(&frame.payload) {
                    Ok(head) => head,
                    Err(e) => {
                        warn!(peer = %peer, stream_id = frame.stream_id, error = %e, "bad request head");
                        conn.write_frame(&Frame::reset(
                            frame.stream_id,
                            reset_code::PROTOCOL_ERROR,
                        ))
                        .await?;
                        continue;
                    }
                };

                let mut stream = Stream::new(frame.stream_id, flow);
                if stream.recv_headers(frame.end_stream()).is_err() {
                    // Unreachable for a fresh stream, but keep the reset path.
                    conn.write_frame(&Frame::reset(frame.stream_id, reset_code::PROTOCOL_ERROR))
                        .await?;
                    continue;
                }

                let mut entry = StreamEntry::new(stream);
                entry.head = Some(head);
                let id = frame.stream_id;
                let complete = frame.end_stream();
                streams.insert(id, entry);

                if complete {
                    respond(&mut conn, &mut streams, id, &mux, &mut conn_outbound).await?;
                }
            }

            FrameType::Data => {
                let id = frame.stream_id;
                let len = frame.payload.len() as u32;

                // Connection-level accounting first: exceeding it is a
                // connection error, not just a stream error.
                if let Err(e) = conn_inbound.consume(len) {
                    error!(peer = %peer, error = %e, "connection flow window exceeded");
                    return Err(ConnectionError::Io(std::io::Error::other(e)));
                }
                conn_consumed = conn_consumed.saturating_add(len);
                if conn_consumed >= flow.replenish_threshold.max(1) {
                    if conn_inbound.grant(conn_consumed).is_ok() {
                        conn.write_frame(&Frame::window_update(0, conn_consumed))
                            .await?;
                    }
                    conn_consumed = 0;
                }

                let Some(entry) = streams.get_mut(&id) else {
                    debug!(peer = %peer, stream_id = id, "data for unknown stream");
                    conn.write_frame(&Frame::reset(id, reset_code::PROTOCOL_ERROR))
                        .await?;
                    continue;
                };

                match entry.stream.recv_data(len, frame.end_stream()) {
                    Ok(()) => {}
                    Err(e @ StreamError::FlowControlViolation { .. }) => {
                        warn!(peer = %peer, stream_id = id, error = %e, "stream flow window exceeded");
                        conn.write_frame(&Frame::reset(id, reset_code::FLOW_CONTROL_ERROR))
                            .await?;
                        streams.remove(&id);
                        continue;
                    }
                    Err(e) => {
                        warn!(peer = %peer, stream_id = id, error = %e, "data in invalid state");
                        conn.write_frame(&Frame::reset(id, reset_code::PROTOCOL_ERROR))
                            .await?;
                        streams.remove(&id);
                        continue;
                    }
                }

                // Flow-control credit comes back automatically, so it does
                // not bound the total body size; the request cap does.
                if entry.body.len() + frame.payload.len() > config.max_request_size {
                    warn!(
                        peer = %peer,
                        stream_id = id,
                        size = entry.body.len() + frame.payload.len(),
                        "request body exceeds the accepted size"
                    );
                    conn.write_frame(&Frame::reset(id, reset_code::PAYLOAD_TOO_LARGE))
                        .await?;
                    streams.remove(&id);
                    continue;
                }

                entry.body.extend_from_slice(&frame.payload);

                // Replenish stream credit once the consumed tally crosses
                // the threshold.
                if let Some(credit) = entry.stream.take_replenish() {
                    conn.write_frame(&Frame::window_update(id, credit)).await?;
                }

                if frame.end_stream() {
                    respond(&mut conn, &mut streams, id, &mux, &mut conn_outbound).await?;
                }
            }

            FrameType::WindowUpdate => {
                let credit = frame.credit()?;
                if credit == 0 {
                    warn!(peer = %peer, stream_id = frame.stream_id, "zero window update");
                    conn.write_frame(&Frame::reset(frame.stream_id, reset_code::PROTOCOL_ERROR))
                        .await?;
                    continue;
                }

                if frame.stream_id == 0 {
                    if let Err(e) = conn_outbound.grant(credit) {
                        error!(peer = %peer, error = %e, "connection window overflow");
                        return Err(ConnectionError::Io(std::io::Error::other(e)));
                    }
                    // Connection credit may unblock any stream.
                    let ids: Vec<u32> = streams.keys().copied().collect();
                    for id in ids {
                        flush_pending(&mut conn, &mut streams, id, &mut conn_outbound).await?;
                    }
                } else if let Some(entry) = streams.get_mut(&frame.stream_id) {
                    match entry.stream.recv_window_update(credit) {
                        Ok(()) => {
                            flush_pending(
                                &mut conn,
                                &mut streams,
                                frame.stream_id,
                                &mut conn_outbound,
                            )
                            .await?;
                        }
                        Err(e @ StreamError::WindowOverflow { .. }) => {
                            warn!(peer = %peer, stream_id = frame.stream_id, error = %e, "stream window overflow");
                            conn.write_frame(&Frame::reset(
                                frame.stream_id,
                                reset_code::FLOW_CONTROL_ERROR,
                            ))
                            .await?;
                            streams.remove(&frame.stream_id);
                        }
                        Err(_) => {
                            streams.remove(&frame.stream_id);
                        }
                    }
                }
                // Updates for unknown streams arrive benignly after local
                // cleanup; ignore them.
            }

            FrameType::Reset => {
                let code = frame.error_code()?;
                debug!(peer = %peer, stream_id = frame.stream_id, code, "stream reset by peer");
                if let Some(mut entry) = streams.remove(&frame.stream_id) {
                    entry.stream.reset();
                }
            }
        }
    }

    debug!(peer = %peer, "connection closed by peer");
    Ok(())
}

/// Dispatches the completed request on stream `id` and starts sending the
/// response.
async fn respond(
    conn: &mut Connection,
    streams: &mut HashMap<u32, StreamEntry>,
    id: u32,
    mux: &RequestMux,
    conn_outbound: &mut FlowWindow,
) -> Result<(), ConnectionError> {
    let Some(entry) = streams.get_mut(&id) else {
        return Ok(());
    };
    let Some(head) = entry.head.take() else {
        conn.write_frame(&Frame::reset(id, reset_code::PROTOCOL_ERROR))
            .await?;
        streams.remove(&id);
        return Ok(());
    };

    let body = std::mem::take(&mut entry.body).freeze();
    let request = Request::from_head(head, body);
    debug!(stream_id = id, path = %request.path(), "dispatching request");

    let response = mux.dispatch(request).await;
    let (head, body) = response.into_parts();

    let head_bytes = match head.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(stream_id = id, error = %e, "failed to encode response head");
            conn.write_frame(&Frame::reset(id, reset_code::INTERNAL_ERROR))
                .await?;
            streams.remove(&id);
            return Ok(());
        }
    };

    let end = body.is_empty();
    if entry.stream.send_headers(end).is_err() {
        streams.remove(&id);
        return Ok(());
    }
    conn.write_frame(&Frame::headers(id, head_bytes, end)).await?;
    entry.pending = body;

    flush_pending(conn, streams, id, conn_outbound).await
}

/// Sends as much pending response body as current credit allows.
///
/// Respects both the stream and connection outbound windows: a chunk is
/// sent only when both have capacity, and consumes both. Anything left
/// stays queued until the peer grants more credit.
async fn flush_pending(
    conn: &mut Connection,
    streams: &mut HashMap<u32, StreamEntry>,
    id: u32,
    conn_outbound: &mut FlowWindow,
) -> Result<(), ConnectionError> {
    let Some(entry) = streams.get_mut(&id) else {
        return Ok(());
    };

    while !entry.pending.is_empty() {
        let allowance = entry
            .stream
            .outbound_available()
            .min(conn_outbound.available()) as usize;
        let chunk_len = entry.pending.len().min(allowance).min(MAX_DATA_CHUNK);
        if chunk_len == 0 {
            // Out of credit: leave the remainder queued for the next
            // window update.
            conn.flush().await?;
            return Ok(());
        }

        let chunk = entry.pending.split_to(chunk_len);
        let last = entry.pending.is_empty();

        if let Err(e) = entry.stream.send_data(chunk_len as u32, last) {
            warn!(stream_id = id, error = %e, "dropping response mid-stream");
            streams.remove(&id);
            return Ok(());
        }
        if let Err(e) = conn_outbound.consume(chunk_len as u32) {
            // Guarded by the allowance above.
            error!(stream_id = id, error = %e, "connection window accounting mismatch");
            streams.remove(&id);
            return Ok(());
        }

        conn.write_frame(&Frame::data(id, chunk, last)).await?;
    }
    conn.flush().await?;

    if entry.stream.is_closed() {
        streams.remove(&id);
    }
    Ok(())
}
