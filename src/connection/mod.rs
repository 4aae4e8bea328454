//! Per-connection driver and lifecycle.
//!
//! A [`WebSocket`] is created by the handshake once the 101 response is on
//! the wire. It splits into a [`WsSender`], which any number of tasks may
//! clone and write through, and a [`WsReceiver`], whose `recv` loop reads
//! frames and performs the protocol's automatic replies.
//!
//! ## Connection Lifecycle
//!
//! 1. **Open** - after the handshake
//! 2. **Closing** - a close frame has been sent or received
//! 3. **Closed** - close exchange finished, close timeout elapsed, protocol
//!    violation or transport failure
//!
//! ## Example
//!
//! ```rust,ignore
//! let (sender, mut receiver) = ws.split();
//!
//! tokio::spawn(async move {
//!     sender.send(Message::text("Hello")).await?;
//!     sender.closed().await;
//! });
//!
//! while let Some(msg) = receiver.recv().await? {
//!     tracing::info!(?msg, "received");
//! }
//! ```

mod state;

#[allow(clippy::module_inception)]
mod connection;

pub use connection::{WebSocket, WsReceiver, WsSender};
pub use state::{CloseAction, ConnectionState, Lifecycle};
