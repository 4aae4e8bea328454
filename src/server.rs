//! Minimal HTTP/1.1 boundary that hosts WebSocket endpoints.
//!
//! # Example
//!
//! ```ignore
//! use wsraw::{Config, Message, Router, Server};
//!
//! let router = Router::new().websocket("/ws", |ws, _req| async move {
//!     let (sender, mut receiver) = ws.split();
//!     while let Ok(Some(msg)) = receiver.recv().await {
//!         if let Message::Text(text) = msg {
//!             let _ = sender.send(Message::Text(text)).await;
//!         }
//!     }
//! });
//!
//! let server = Server::bind("127.0.0.1:8080", router, Config::server()).await?;
//! server.run().await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{Config, Limits};
use crate::connection::WebSocket;
use crate::error::{Error, Result};
use crate::protocol::handshake::{self, HandshakeRequest, Hijacker, write_error_response};

/// The stream a WebSocket handler receives: the accepted TCP connection,
/// together with whatever the HTTP layer had already buffered past the
/// request head.
pub type Upgraded = BufReader<TcpStream>;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type BoxedHandler = Arc<dyn Fn(WebSocket<Upgraded>, HandshakeRequest) -> BoxFuture + Send + Sync>;

/// Path to handler table, built explicitly and handed to [`Server::bind`].
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, BoxedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve WebSocket upgrades on `path`. Registering a path twice keeps the
    /// last handler.
    pub fn websocket<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WebSocket<Upgraded>, HandshakeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: BoxedHandler =
            Arc::new(move |ws: WebSocket<Upgraded>, req: HandshakeRequest| -> BoxFuture {
                Box::pin(handler(ws, req))
            });
        self.routes.insert(path.into(), handler);
        self
    }

    fn route(&self, path: &str) -> Option<BoxedHandler> {
        self.routes.get(path).cloned()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Accept loop bound to a TCP listener.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    config: Config,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs, router: Router, config: Config) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            routes = router.len(),
            "websocket server listening"
        );
        Ok(Self {
            listener,
            router: Arc::new(router),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already handed to a
    /// handler keep running.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("websocket server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&self.router);
                        let config = self.config.clone();
                        tokio::spawn(
                            serve_connection(stream, router, config)
                                .instrument(info_span!("connection", %peer)),
                        );
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }
    }
}

/// Hands the buffered TCP stream to the handshake exactly once. If the
/// handshake fails before taking it, the stream is still here to answer on.
struct TcpHijacker {
    stream: Option<Upgraded>,
}

impl Hijacker for &mut TcpHijacker {
    type Io = Upgraded;

    fn hijack(self) -> io::Result<Upgraded> {
        self.stream
            .take()
            .ok_or_else(|| io::Error::other("connection already hijacked"))
    }
}

async fn serve_connection(stream: TcpStream, router: Arc<Router>, config: Config) {
    let mut reader = BufReader::new(stream);

    let head = match tokio::time::timeout(
        config.handshake_timeout,
        read_head(&mut reader, &config.limits),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(Error::HandshakeTooLarge { size, max })) => {
            warn!(size, max, "request head too large");
            reject(reader, 431, "Request head too large").await;
            return;
        }
        Ok(Err(err)) => {
            debug!(error = %err, "connection ended before request head");
            return;
        }
        Err(_) => {
            debug!("timed out waiting for request head");
            reject(reader, 408, "Request timeout").await;
            return;
        }
    };

    let request = match HandshakeRequest::parse(&head) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed request head");
            reject(reader, 400, &err.to_string()).await;
            return;
        }
    };

    let Some(handler) = router.route(request.path()) else {
        debug!(path = request.path(), "no route");
        reject(reader, 404, "Not found").await;
        return;
    };

    if request.method != "GET" {
        debug!(method = %request.method, "method not allowed");
        reject(reader, 405, "Method not allowed").await;
        return;
    }

    let mut hijacker = TcpHijacker {
        stream: Some(reader),
    };
    match handshake::accept(&request, Some(&mut hijacker), config).await {
        Ok(ws) => handler(ws, request).await,
        Err(err) => {
            warn!(error = %err, status = err.status(), "upgrade rejected");
            if let Some(stream) = hijacker.stream.take() {
                let mut buf = Vec::new();
                err.write_response(&mut buf);
                send_and_close(stream, &buf).await;
            }
        }
    }
}

/// Read a request head up to and including the blank line, never holding
/// more than `max_handshake_size` bytes. Bytes after the head stay in the
/// reader's buffer.
async fn read_head<R>(reader: &mut R, limits: &Limits) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();

    loop {
        let budget = (limits.max_handshake_size + 1).saturating_sub(head.len());
        let n = (&mut *reader)
            .take(budget as u64)
            .read_until(b'\n', &mut head)
            .await?;
        limits.check_handshake_size(head.len())?;

        if n == 0 {
            return Err(Error::ConnectionClosed(None));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
    }
}

async fn reject(stream: Upgraded, status: u16, body: &str) {
    let mut buf = Vec::new();
    write_error_response(status, body, &mut buf);
    send_and_close(stream, &buf).await;
}

async fn send_and_close(mut stream: Upgraded, response: &[u8]) {
    if let Err(err) = stream.write_all(response).await {
        debug!(error = %err, "failed to write rejection");
        return;
    }
    let _ = stream.shutdown().await;
}
