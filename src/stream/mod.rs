//! Stream lifecycle and flow control.
//!
//! A [`Stream`] is one logical request/response exchange multiplexed over a
//! shared connection. It owns a state machine
//! (`Idle → Open → HalfClosed(Local|Remote) → Closed`) and two independent
//! byte-credit windows, one per direction. The owning connection keeps a
//! second pair of [`FlowWindow`]s; sending data needs credit in both the
//! stream and connection windows, and consumes both.
//!
//! Headers are out-of-band from data flow control: sending or receiving a
//! HEADERS frame never consumes window.

use thiserror::Error;

/// Largest value any flow-control window may hold.
pub const MAX_WINDOW: u32 = (1 << 31) - 1;

/// Flow-control tuning knobs.
///
/// The defaults are conservative: a 64 KiB initial window, replenished once
/// half of it has been consumed, with the wire-maximum ceiling.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Initial credit granted to each new stream window.
    pub initial_window: u32,
    /// Initial credit granted to each connection-level window.
    pub initial_connection_window: u32,
    /// Ceiling no window may exceed; granting past it is a protocol error.
    pub max_window: u32,
    /// Consumed inbound bytes after which credit is replenished to the peer.
    pub replenish_threshold: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            initial_window: 65_535,
            initial_connection_window: 1 << 20,
            max_window: MAX_WINDOW,
            replenish_threshold: 65_535 / 2,
        }
    }
}

/// Errors produced by stream state and window accounting.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("flow control violation: {requested} bytes requested, {available} available")]
    FlowControlViolation { requested: u32, available: u32 },

    #[error("window update of {credit} would exceed the {max}-byte window maximum")]
    WindowOverflow { credit: u32, max: u32 },

    #[error("stream is closed")]
    Closed,

    #[error("invalid {event} in state {state:?}")]
    InvalidTransition {
        state: StreamState,
        event: &'static str,
    },
}

/// Lifecycle states of a stream.
///
/// Transitions are monotonic: once `Closed` is reached no further
/// transition is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No headers exchanged yet.
    Idle,
    /// Headers exchanged, both directions open.
    Open,
    /// This endpoint has ended its send side.
    HalfClosedLocal,
    /// The peer has ended its send side.
    HalfClosedRemote,
    /// Both directions ended, or the stream was reset.
    Closed,
}

/// A byte-credit balance limiting how much unacknowledged data one endpoint
/// may send.
///
/// The balance never goes negative: [`consume`](Self::consume) rejects a
/// charge that exceeds the balance, and [`grant`](Self::grant) rejects
/// credit that would push the balance past the configured maximum — an
/// overflow is a protocol error, never silent wraparound.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    available: u32,
    max: u32,
}

impl FlowWindow {
    /// Creates a window with `initial` credit and ceiling `max`.
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            available: initial.min(max),
            max,
        }
    }

    /// Returns the credit currently available.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Charges `n` bytes against the window.
    pub fn consume(&mut self, n: u32) -> Result<(), StreamError> {
        if n > self.available {
            return Err(StreamError::FlowControlViolation {
                requested: n,
                available: self.available,
            });
        }
        self.available -= n;
        Ok(())
    }

    /// Adds `n` bytes of credit.
    pub fn grant(&mut self, n: u32) -> Result<(), StreamError> {
        match self.available.checked_add(n) {
            Some(total) if total <= self.max => {
                self.available = total;
                Ok(())
            }
            _ => Err(StreamError::WindowOverflow {
                credit: n,
                max: self.max,
            }),
        }
    }
}

/// One multiplexed exchange with its state machine and windows.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    state: StreamState,
    inbound: FlowWindow,
    outbound: FlowWindow,
    replenish_threshold: u32,
    consumed_since_update: u32,
}

impl Stream {
    /// Creates a stream in the `Idle` state with fresh windows.
    pub fn new(id: u32, config: &FlowConfig) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            inbound: FlowWindow::new(config.initial_window, config.max_window),
            outbound: FlowWindow::new(config.initial_window, config.max_window),
            replenish_threshold: config.replenish_threshold,
            consumed_since_update: 0,
        }
    }

    /// Returns the stream id, unique and strictly increasing per connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Returns `true` once the stream has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Credit the peer may still spend sending to this endpoint.
    pub fn inbound_available(&self) -> u32 {
        self.inbound.available()
    }

    /// Credit this endpoint may still spend sending to the peer.
    pub fn outbound_available(&self) -> u32 {
        self.outbound.available()
    }

    /// Records receipt of a HEADERS frame. Never consumes window.
    pub fn recv_headers(&mut self, end_stream: bool) -> Result<(), StreamError> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            StreamState::Closed => Err(StreamError::Closed),
            state => Err(StreamError::InvalidTransition {
                state,
                event: "recv_headers",
            }),
        }
    }

    /// Records transmission of a HEADERS frame. Never consumes window.
    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), StreamError> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            StreamState::Open if end_stream => {
                self.state = StreamState::HalfClosedLocal;
                Ok(())
            }
            StreamState::Open | StreamState::HalfClosedRemote if !end_stream => Ok(()),
            StreamState::HalfClosedRemote => {
                self.state = StreamState::Closed;
                Ok(())
            }
            StreamState::Closed => Err(StreamError::Closed),
            state => Err(StreamError::InvalidTransition {
                state,
                event: "send_headers",
            }),
        }
    }

    /// Records receipt of `len` body bytes, charging the inbound window.
    ///
    /// Fails with [`StreamError::FlowControlViolation`] when the peer sent
    /// more than its remaining credit; the caller must terminate the stream
    /// rather than accept the bytes.
    pub fn recv_data(&mut self, len: u32, end_stream: bool) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::Closed => return Err(StreamError::Closed),
            state => {
                return Err(StreamError::InvalidTransition {
                    state,
                    event: "recv_data",
                });
            }
        }

        self.inbound.consume(len)?;
        self.consumed_since_update = self.consumed_since_update.saturating_add(len);

        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                _ => StreamState::Closed,
            };
        }
        Ok(())
    }

    /// Records transmission of `len` body bytes, charging the outbound window.
    ///
    /// The caller must additionally charge the connection-level window;
    /// this method only accounts for the stream's own credit.
    pub fn send_data(&mut self, len: u32, end_stream: bool) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => {}
            StreamState::Closed => return Err(StreamError::Closed),
            state => {
                return Err(StreamError::InvalidTransition {
                    state,
                    event: "send_data",
                });
            }
        }

        self.outbound.consume(len)?;

        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                _ => StreamState::Closed,
            };
        }
        Ok(())
    }

    /// Applies a WINDOW_UPDATE from the peer to the outbound window.
    pub fn recv_window_update(&mut self, credit: u32) -> Result<(), StreamError> {
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed);
        }
        self.outbound.grant(credit)
    }

    /// Returns replenishment credit owed to the peer, if the consumed tally
    /// has crossed the threshold.
    ///
    /// On `Some(credit)`, the inbound window has already been re-granted and
    /// the tally reset; the caller must emit a WINDOW_UPDATE for `credit`.
    pub fn take_replenish(&mut self) -> Option<u32> {
        if self.consumed_since_update < self.replenish_threshold.max(1) {
            return None;
        }
        let credit = self.consumed_since_update;
        // The credit being returned was consumed from the window, so
        // re-granting it cannot overflow the maximum.
        self.inbound.grant(credit).ok()?;
        self.consumed_since_update = 0;
        Some(credit)
    }

    /// Immediately moves the stream to `Closed`, from any state.
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u32) -> FlowConfig {
        FlowConfig {
            initial_window: initial,
            ..FlowConfig::default()
        }
    }

    fn open_stream(initial: u32) -> Stream {
        let mut s = Stream::new(1, &config(initial));
        s.recv_headers(false).unwrap();
        s
    }

    // ── FlowWindow ────────────────────────────────────────────────────────────

    #[test]
    fn window_never_goes_negative() {
        let mut w = FlowWindow::new(10, MAX_WINDOW);
        w.consume(10).unwrap();
        assert_eq!(w.available(), 0);
        assert!(matches!(
            w.consume(1),
            Err(StreamError::FlowControlViolation {
                requested: 1,
                available: 0
            })
        ));
        assert_eq!(w.available(), 0);
    }

    #[test]
    fn window_overflow_is_an_error() {
        let mut w = FlowWindow::new(MAX_WINDOW - 5, MAX_WINDOW);
        assert!(matches!(
            w.grant(10),
            Err(StreamError::WindowOverflow { .. })
        ));
        // Balance unchanged after a rejected grant.
        assert_eq!(w.available(), MAX_WINDOW - 5);
        w.grant(5).unwrap();
        assert_eq!(w.available(), MAX_WINDOW);
    }

    #[test]
    fn cumulative_sends_never_exceed_credit() {
        let mut w = FlowWindow::new(100, MAX_WINDOW);
        let mut sent = 0u32;
        for chunk in [30u32, 30, 30, 30] {
            if w.consume(chunk).is_ok() {
                sent += chunk;
            }
        }
        assert_eq!(sent, 90);
        w.grant(50).unwrap();
        w.consume(40).unwrap();
        assert!(sent + 40 <= 150);
    }

    // ── state machine ─────────────────────────────────────────────────────────

    #[test]
    fn request_response_lifecycle() {
        let mut s = Stream::new(1, &FlowConfig::default());
        assert_eq!(s.state(), StreamState::Idle);

        s.recv_headers(false).unwrap();
        assert_eq!(s.state(), StreamState::Open);

        s.recv_data(10, true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);

        s.send_headers(false).unwrap();
        s.send_data(5, true).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn headers_with_end_stream_skips_open() {
        let mut s = Stream::new(1, &FlowConfig::default());
        s.recv_headers(true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn half_closed_local_reached_only_from_open() {
        let mut s = open_stream(100);
        s.send_data(1, true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        // The remaining direction ending closes the stream.
        s.recv_data(1, true).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let mut s = open_stream(100);
        s.reset();
        assert!(s.is_closed());
        assert!(matches!(s.recv_headers(false), Err(StreamError::Closed)));
        assert!(matches!(s.recv_data(1, false), Err(StreamError::Closed)));
        assert!(matches!(s.send_data(1, false), Err(StreamError::Closed)));
        assert!(matches!(
            s.recv_window_update(1),
            Err(StreamError::Closed)
        ));
        assert!(s.is_closed());
    }

    #[test]
    fn data_before_headers_rejected() {
        let mut s = Stream::new(1, &FlowConfig::default());
        assert!(matches!(
            s.recv_data(1, false),
            Err(StreamError::InvalidTransition { .. })
        ));
    }

    // ── flow control ──────────────────────────────────────────────────────────

    #[test]
    fn receive_consumes_inbound_window() {
        // Window 100: a 40-byte chunk leaves 60; a 70-byte chunk before
        // replenishment is a flow-control violation.
        let mut s = open_stream(100);
        s.recv_data(40, false).unwrap();
        assert_eq!(s.inbound_available(), 60);
        assert!(matches!(
            s.recv_data(70, false),
            Err(StreamError::FlowControlViolation { .. })
        ));
        assert_eq!(s.inbound_available(), 60);
    }

    #[test]
    fn headers_do_not_consume_window() {
        let mut s = Stream::new(1, &config(100));
        s.recv_headers(false).unwrap();
        s.send_headers(false).unwrap();
        assert_eq!(s.inbound_available(), 100);
        assert_eq!(s.outbound_available(), 100);
    }

    #[test]
    fn send_blocked_without_credit() {
        let mut s = open_stream(10);
        s.send_data(10, false).unwrap();
        assert!(matches!(
            s.send_data(1, false),
            Err(StreamError::FlowControlViolation { .. })
        ));
        s.recv_window_update(5).unwrap();
        s.send_data(5, false).unwrap();
        assert_eq!(s.outbound_available(), 0);
    }

    #[test]
    fn replenish_fires_at_threshold() {
        let mut s = Stream::new(
            1,
            &FlowConfig {
                initial_window: 100,
                replenish_threshold: 50,
                ..FlowConfig::default()
            },
        );
        s.recv_headers(false).unwrap();

        s.recv_data(40, false).unwrap();
        assert_eq!(s.take_replenish(), None);

        s.recv_data(20, false).unwrap();
        assert_eq!(s.take_replenish(), Some(60));
        assert_eq!(s.inbound_available(), 100);
        assert_eq!(s.take_replenish(), None);
    }
}
