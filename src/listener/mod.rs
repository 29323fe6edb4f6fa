//! TCP listener with an explicit lifecycle.
//!
//! A [`Listener`] moves through `Created → Listening → Closed`. It is
//! constructed with a textual endpoint, bound by [`start`](Listener::start),
//! and yields one [`Connection`] per accepted peer until
//! [`close`](Listener::close) is called. `Closed` is terminal: every
//! operation afterwards fails with [`ListenerError::Closed`].

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::conn::{Connection, ConnectionError};

/// Errors produced by listener lifecycle operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("malformed endpoint address: {text:?}")]
    InvalidAddress { text: String },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient privileges to bind to {addr}")]
    Permission { addr: SocketAddr },

    #[error("listener is closed")]
    Closed,

    #[error("listener has not been started")]
    NotListening,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Parses a textual `host` and `port` into a typed socket address.
///
/// The host must be an IP literal; name resolution is deliberately out of
/// scope for the listener.
pub fn parse_endpoint(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let ip: IpAddr = host.parse().map_err(|_| ListenerError::InvalidAddress {
        text: format!("{host}:{port}"),
    })?;
    Ok(SocketAddr::new(ip, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Listening,
    Closed,
}

/// An accepting socket bound to one local endpoint.
pub struct Listener {
    host: String,
    port: u16,
    state: State,
    inner: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

impl Listener {
    /// Creates a listener in the `Created` state; no socket is bound yet.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: State::Created,
            inner: None,
            local_addr: None,
        }
    }

    /// Binds the configured endpoint and transitions to `Listening`.
    ///
    /// # Errors
    ///
    /// - [`ListenerError::InvalidAddress`] — the host is not an IP literal.
    /// - [`ListenerError::Permission`] — binding needs privileges this
    ///   process lacks.
    /// - [`ListenerError::Bind`] — the address is in use or otherwise
    ///   unbindable.
    /// - [`ListenerError::Closed`] — the listener was already closed.
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        match self.state {
            State::Created => {}
            State::Listening => return Ok(()),
            State::Closed => return Err(ListenerError::Closed),
        }

        let addr = parse_endpoint(&self.host, self.port)?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ListenerError::Permission { addr }
            } else {
                ListenerError::Bind { addr, source: e }
            }
        })?;

        self.local_addr = Some(listener.local_addr()?);
        self.inner = Some(listener);
        self.state = State::Listening;
        info!(address = %self.local_addr.unwrap_or(addr), "listening");
        Ok(())
    }

    /// Returns `true` while the listener is accepting connections.
    pub fn is_listening(&self) -> bool {
        self.state == State::Listening
    }

    /// Returns the bound local address once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Completes with the next accepted peer connection.
    ///
    /// # Errors
    ///
    /// - [`ListenerError::NotListening`] — `start` has not been called.
    /// - [`ListenerError::Closed`] — the listener was closed.
    pub async fn accept(&mut self) -> Result<Connection, ListenerError> {
        let listener = match self.state {
            State::Listening => self
                .inner
                .as_ref()
                .ok_or(ListenerError::NotListening)?,
            State::Created => return Err(ListenerError::NotListening),
            State::Closed => return Err(ListenerError::Closed),
        };

        let (socket, peer_addr) = listener.accept().await?;
        debug!(peer = %peer_addr, "connection accepted");
        Ok(Connection::new(socket, peer_addr)?)
    }

    /// Stops accepting and transitions to the terminal `Closed` state.
    ///
    /// Idempotent. Pending `accept` callers are cancelled when the bound
    /// socket is dropped here.
    pub fn close(&mut self) {
        if self.state != State::Closed {
            self.inner = None;
            self.state = State::Closed;
            debug!(address = ?self.local_addr, "listener closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("127.0.0.1", 8080).unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(parse_endpoint("::1", 0).is_ok());
        assert!(matches!(
            parse_endpoint("not-an-ip", 80),
            Err(ListenerError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn lifecycle() {
        let mut listener = Listener::new("127.0.0.1", 0);
        assert!(!listener.is_listening());

        listener.start().await.unwrap();
        assert!(listener.is_listening());
        assert!(listener.local_addr().is_some());

        listener.close();
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let mut listener = Listener::new("127.0.0.1", 0);
        listener.start().await.unwrap();
        listener.close();

        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
        assert!(matches!(listener.start().await, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn accept_before_start_fails() {
        let mut listener = Listener::new("127.0.0.1", 0);
        assert!(matches!(
            listener.accept().await,
            Err(ListenerError::NotListening)
        ));
    }

    #[tokio::test]
    async fn bind_conflict_reported() {
        let mut first = Listener::new("127.0.0.1", 0);
        first.start().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let mut second = Listener::new("127.0.0.1", port);
        assert!(matches!(
            second.start().await,
            Err(ListenerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_address_reported() {
        let mut listener = Listener::new("example.invalid", 80);
        assert!(matches!(
            listener.start().await,
            Err(ListenerError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn accepts_a_peer() {
        let mut listener = Listener::new("127.0.0.1", 0);
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, accepted) = tokio::join!(Connection::connect(addr), listener.accept());
        conn.unwrap();
        accepted.unwrap();
    }
}
