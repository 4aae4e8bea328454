//! Connection lifecycle as defined in RFC 6455 Section 7.

use std::time::Duration;

use tokio::time::Instant;

/// WebSocket connection state.
///
/// A connection starts `Open` once the handshake has completed, and only
/// ever moves forward: `Open -> Closing -> Closed`, or straight to `Closed`
/// when the transport fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Connection is open and ready for data transfer.
    #[default]
    Open,
    /// A close frame has been sent or received, the exchange is unfinished.
    Closing,
    /// Connection is fully closed. Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns `true` for `Open` and `Closing`.
    #[must_use]
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }

    /// Sending application data is allowed only while `Open`.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Frames are still read while `Open` or `Closing`.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// What to do after a peer's close frame has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// We have not sent a close frame yet; answer with one.
    Reply,
    /// Our close frame is already out; the exchange is complete.
    Finish,
}

/// Per-connection lifecycle bookkeeping.
///
/// Guarantees that at most one close frame is ever sent: only the first
/// caller of [`begin_local_close`](Self::begin_local_close) or the
/// [`CloseAction::Reply`] path may write one.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    close_sent: bool,
    close_received: bool,
    closing_since: Option<Instant>,
    last_pong: Option<Instant>,
    last_frame: Option<Instant>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Open,
            close_sent: false,
            close_received: false,
            closing_since: None,
            last_pong: None,
            last_frame: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    #[must_use]
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Local side wants to close. Returns `true` if the caller must now send
    /// the close frame, `false` if one was already sent or the connection
    /// is past `Open`.
    pub fn begin_local_close(&mut self) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        self.state = ConnectionState::Closing;
        self.close_sent = true;
        self.closing_since = Some(Instant::now());
        true
    }

    /// Record the peer's close frame.
    pub fn on_close_received(&mut self) -> CloseAction {
        self.close_received = true;
        match self.state {
            ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                self.closing_since = Some(Instant::now());
                CloseAction::Reply
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                self.state = ConnectionState::Closed;
                CloseAction::Finish
            }
        }
    }

    /// The reply to the peer's close frame has been written.
    pub fn on_reply_sent(&mut self) {
        self.close_sent = true;
        self.state = ConnectionState::Closed;
    }

    /// Force the terminal state. Returns `true` if this call made the
    /// transition.
    pub fn finish(&mut self) -> bool {
        let was_active = self.state.is_active();
        self.state = ConnectionState::Closed;
        was_active
    }

    /// Instant after which a `Closing` connection is torn down regardless of
    /// the peer. `None` outside of `Closing`.
    #[must_use]
    pub fn grace_deadline(&self, close_timeout: Duration) -> Option<Instant> {
        match self.state {
            ConnectionState::Closing => self.closing_since.map(|since| since + close_timeout),
            _ => None,
        }
    }

    pub fn record_pong(&mut self) {
        self.last_pong = Some(Instant::now());
    }

    pub fn record_frame(&mut self) {
        self.last_frame = Some(Instant::now());
    }

    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    #[must_use]
    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }
}
