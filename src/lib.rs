//! # wsraw - server-side RFC 6455 WebSocket core
//!
//! `wsraw` turns an HTTP/1.1 connection that asked to be upgraded into a
//! WebSocket connection and drives it until it is closed.
//!
//! ## Layers
//!
//! - [`protocol`]: pure parts. Opcodes, masking, frame encode/decode,
//!   inbound frame validation, handshake validation and the 101 response.
//! - [`codec`]: frame reading and writing over async byte streams.
//! - [`connection`]: the per-connection read loop, serialized writes and
//!   the `Open -> Closing -> Closed` lifecycle.
//! - [`server`]: a small TCP/HTTP boundary with an explicit [`Router`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wsraw::{Config, Message, Router, Server};
//!
//! let router = Router::new().websocket("/ws", |ws, _req| async move {
//!     let (sender, mut receiver) = ws.split();
//!     while let Ok(Some(Message::Text(text))) = receiver.recv().await {
//!         let _ = sender.send(Message::Text(text)).await;
//!     }
//! });
//!
//! Server::bind("127.0.0.1:8080", router, Config::server()).await?.run().await?;
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod server;

pub use config::{Config, Limits};
pub use connection::{ConnectionState, WebSocket, WsReceiver, WsSender};
pub use error::{Error, HandshakeError, Result};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::handshake::{Hijacker, accept};
pub use protocol::{Frame, HandshakeRequest, HandshakeResponse, OpCode, WS_GUID, compute_accept_key};
pub use server::{Router, Server, Upgraded};
