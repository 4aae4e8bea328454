use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::codec::{FrameWriter, read_frame};
use crate::config::Config;
use crate::connection::state::{CloseAction, ConnectionState, Lifecycle};
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::assembler::{AssembledMessage, MessageAssembler};
use crate::protocol::validation::FrameValidator;
use crate::protocol::{Frame, OpCode};

/// State shared by both halves of one connection.
struct Shared<S> {
    /// Single serialization point for every outbound frame.
    writer: Mutex<FrameWriter<WriteHalf<S>>>,
    lifecycle: StdMutex<Lifecycle>,
    /// Mirrors `lifecycle.state()`. Reaching `Closed` is the termination
    /// broadcast.
    state_tx: watch::Sender<ConnectionState>,
    config: Config,
}

impl<S> Shared<S> {
    /// Apply a lifecycle transition and publish the resulting state.
    fn update<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> R {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut lifecycle);
        let state = lifecycle.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        out
    }

    fn read<R>(&self, f: impl FnOnce(&Lifecycle) -> R) -> R {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        f(&lifecycle)
    }

    fn state(&self) -> ConnectionState {
        self.read(Lifecycle::state)
    }

    fn grace_deadline(&self) -> Option<Instant> {
        self.read(|l| l.grace_deadline(self.config.close_timeout))
    }
}

impl<S: AsyncWrite> Shared<S> {
    /// Enter `Closed` and release the write side. The caller already holds
    /// the write lock.
    async fn finish_locked(&self, writer: &mut MutexGuard<'_, FrameWriter<WriteHalf<S>>>) {
        if self.update(Lifecycle::finish) {
            info!("connection closed");
        }
        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "write side shutdown failed");
        }
    }

    /// Enter `Closed`, broadcast termination, then release the write side.
    ///
    /// In-flight writes abort on the broadcast, so the lock frees up quickly.
    /// If it does not within `close_timeout`, the shutdown is left to the
    /// last handle dropping the stream.
    async fn teardown(&self) {
        if self.update(Lifecycle::finish) {
            info!("connection closed");
        }
        let Ok(mut writer) = timeout(self.config.close_timeout, self.writer.lock()).await else {
            warn!("write side still busy after close, skipping shutdown");
            return;
        };
        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "write side shutdown failed");
        }
    }

    /// Write one frame under the lock. A failed write ends the connection.
    async fn write_locked(
        &self,
        writer: &mut MutexGuard<'_, FrameWriter<WriteHalf<S>>>,
        frame: &Frame,
    ) -> Result<()> {
        self.write_until(writer, frame, None).await
    }

    /// Write one frame, giving up when the connection reaches `Closed` or
    /// `deadline` passes.
    async fn write_until(
        &self,
        writer: &mut MutexGuard<'_, FrameWriter<WriteHalf<S>>>,
        frame: &Frame,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        let result = tokio::select! {
            result = writer.write_frame(frame) => result,
            _ = state_rx.wait_for(|state| *state == ConnectionState::Closed) => {
                Err(Error::ConnectionClosed(None))
            }
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Err(Error::Io("timed out writing frame".into()))
            }
        };

        if let Err(err) = &result {
            warn!(error = %err, opcode = %frame.opcode, "write failed");
            self.finish_locked(writer).await;
        }
        result
    }
}

/// An accepted WebSocket connection.
///
/// Produced by [`accept`](crate::protocol::handshake::accept) after the 101
/// response has been flushed, always in the `Open` state. Use
/// [`split`](Self::split) to drive reading and writing from different tasks.
pub struct WebSocket<S> {
    sender: WsSender<S>,
    receiver: WsReceiver<S>,
}

impl<S: AsyncRead + AsyncWrite> WebSocket<S> {
    /// Wrap a stream on which the upgrade handshake has already completed.
    pub fn from_upgraded(stream: S, config: Config) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let validator = FrameValidator::new(config.limits.clone())
            .with_accept_unmasked(config.accept_unmasked_frames);
        let assembler = MessageAssembler::new(config.limits.clone());

        let shared = Arc::new(Shared {
            writer: Mutex::new(FrameWriter::new(writer, config.write_buffer_size)),
            lifecycle: StdMutex::new(Lifecycle::new()),
            state_tx,
            config,
        });

        Self {
            sender: WsSender {
                shared: Arc::clone(&shared),
            },
            receiver: WsReceiver {
                reader,
                shared,
                validator,
                assembler,
                state_rx,
            },
        }
    }

    /// Separate the write handle from the read loop.
    pub fn split(self) -> (WsSender<S>, WsReceiver<S>) {
        (self.sender, self.receiver)
    }

    /// Another handle to the write side.
    pub fn sender(&self) -> WsSender<S> {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.sender.state()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// See [`WsReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.receiver.recv().await
    }

    /// See [`WsSender::send`].
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    /// See [`WsSender::close`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.sender.close(code, reason).await
    }
}

/// Write handle of a connection. Cheap to clone; every clone writes through
/// the same lock, so frames from concurrent tasks never interleave.
pub struct WsSender<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for WsSender<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> WsSender<S> {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// When the last pong arrived, if ever.
    pub fn last_pong(&self) -> Option<Instant> {
        self.shared.read(Lifecycle::last_pong)
    }

    /// When the last frame of any kind arrived, if ever.
    pub fn last_frame(&self) -> Option<Instant> {
        self.shared.read(Lifecycle::last_frame)
    }

    /// Resolves once the connection reaches `Closed`.
    ///
    /// Background producers such as heartbeats select on this to stop.
    pub async fn closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

impl<S: AsyncWrite> WsSender<S> {
    /// Send a message.
    ///
    /// `Message::Close` starts the close handshake like [`close`](Self::close).
    ///
    /// ## Errors
    ///
    /// - `Error::ConnectionClosed` once the connection has left `Open`
    /// - `Error::InvalidUtf8` for `Message::InvalidText`
    /// - `Error::ControlFrameTooLarge` for ping/pong payloads over 125 bytes
    /// - I/O errors from the underlying stream
    pub async fn send(&self, message: Message) -> Result<()> {
        let frame = match message {
            Message::Text(text) => Frame::text(text.into_bytes()),
            Message::Binary(data) => Frame::binary(data),
            Message::Ping(data) => Frame::ping(data),
            Message::Pong(data) => Frame::pong(data),
            Message::Close(close) => return self.send_close(close).await,
            Message::InvalidText(_) => return Err(Error::InvalidUtf8),
        };
        self.send_frame(frame).await
    }

    /// Send a single frame. Frames are written unmasked whatever their
    /// `mask` field says.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if frame.opcode == OpCode::Close {
            let close = CloseFrame::parse(frame.payload())?;
            return self.send_close(close).await;
        }
        frame.validate()?;

        let mut writer = self.shared.writer.lock().await;
        // Checked under the lock so nothing can follow our close frame.
        if !self.shared.state().can_send() {
            return Err(Error::ConnectionClosed(None));
        }
        self.shared.write_locked(&mut writer, &frame).await
    }

    pub async fn ping(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Message::Ping(data.into())).await
    }

    /// Start the close handshake.
    ///
    /// Sends the close frame and moves to `Closing`; the connection reaches
    /// `Closed` when the peer answers or the close timeout elapses, both
    /// observed by the read loop. Calling this again, or after the peer
    /// already closed, is a no-op.
    ///
    /// ## Errors
    ///
    /// - `Error::InvalidCloseCode` if `code` may not be sent on the wire
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.send_close(Some(CloseFrame::new(code, reason))).await
    }

    async fn send_close(&self, close: Option<CloseFrame>) -> Result<()> {
        if let Some(close) = &close {
            if !close.code.is_valid() {
                return Err(Error::InvalidCloseCode(close.code.as_u16()));
            }
        }

        let mut writer = self.shared.writer.lock().await;
        if !self.shared.update(Lifecycle::begin_local_close) {
            return Ok(());
        }
        debug!(code = ?close.as_ref().map(|c| c.code.as_u16()), "sending close frame");
        let deadline = self.shared.grace_deadline();
        self.shared
            .write_until(&mut writer, &Frame::close(close.as_ref()), deadline)
            .await
    }
}

/// Read side of a connection.
pub struct WsReceiver<S> {
    reader: ReadHalf<S>,
    shared: Arc<Shared<S>>,
    validator: FrameValidator,
    assembler: MessageAssembler,
    state_rx: watch::Receiver<ConnectionState>,
}

impl<S> WsReceiver<S> {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl<S: AsyncRead + AsyncWrite> WsReceiver<S> {
    /// Receive the next message.
    ///
    /// This is the connection's read loop; protocol duties are carried out
    /// here as frames arrive:
    /// - pings are answered with a pong carrying the same payload, then
    ///   delivered as `Message::Ping`
    /// - fragmented messages are reassembled
    /// - a close frame is answered (unless ours was already sent), the
    ///   connection reaches `Closed`, and the close is delivered
    /// - while `Closing`, data and ping/pong frames are discarded
    ///
    /// Returns `Ok(None)` once the connection is closed: after a clean close,
    /// on EOF, when the close timeout elapses or when another handle ended
    /// the connection.
    ///
    /// ## Errors
    ///
    /// A protocol violation sends a close frame with the matching status
    /// code, closes the connection and is returned. Transport errors close
    /// the connection without further exchange and are returned.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if !self.shared.state().can_receive() {
                return Ok(None);
            }

            let frame = match self.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(err) => return self.fail(err).await,
            };

            match self.dispatch(frame).await {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(err) => return self.fail(err).await,
            }
        }
    }

    /// Wait for a frame, the termination broadcast or the close deadline.
    ///
    /// The in-flight read is kept across state changes so that a transition
    /// to `Closing` never drops half a frame.
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let read = read_frame(&mut self.reader, &self.validator);
        tokio::pin!(read);

        loop {
            let deadline = self.shared.grace_deadline();
            tokio::select! {
                result = &mut read => return result.map(Some),
                changed = self.state_rx.changed() => {
                    if changed.is_err()
                        || *self.state_rx.borrow_and_update() == ConnectionState::Closed
                    {
                        return Ok(None);
                    }
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        timeout = ?self.shared.config.close_timeout,
                        "peer did not complete close handshake"
                    );
                    self.shared.teardown().await;
                    return Ok(None);
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Option<Message>> {
        let state = self.shared.update(|l| {
            l.record_frame();
            l.state()
        });
        debug!(opcode = %frame.opcode, fin = frame.fin, len = frame.payload().len(), "frame received");

        match frame.opcode {
            OpCode::Close => self.on_close(&frame).await.map(Some),
            _ if state == ConnectionState::Closing => {
                debug!(opcode = %frame.opcode, "discarding frame while closing");
                Ok(None)
            }
            OpCode::Ping => {
                let payload = frame.into_payload();
                self.send_pong(&payload).await?;
                Ok(Some(Message::Ping(payload)))
            }
            OpCode::Pong => {
                self.shared.update(Lifecycle::record_pong);
                Ok(Some(Message::Pong(frame.into_payload())))
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => Ok(self
                .assembler
                .push(frame)?
                .map(AssembledMessage::into_message)),
        }
    }

    async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        if !self.shared.state().can_send() {
            return Ok(());
        }
        self.shared
            .write_locked(&mut writer, &Frame::pong(payload.to_vec()))
            .await
    }

    async fn on_close(&mut self, frame: &Frame) -> Result<Message> {
        let close = CloseFrame::parse(frame.payload())?;

        let reply = match &close {
            None => CloseFrame::new(CloseCode::Normal, ""),
            Some(c) if c.code.is_valid() => CloseFrame::new(c.code, ""),
            Some(c) => {
                warn!(code = c.code.as_u16(), "peer sent invalid close code");
                CloseFrame::new(CloseCode::ProtocolError, "")
            }
        };

        let mut writer = self.shared.writer.lock().await;
        let result = match self.shared.update(Lifecycle::on_close_received) {
            CloseAction::Reply => {
                let deadline = self.shared.grace_deadline();
                let result = self
                    .shared
                    .write_until(&mut writer, &Frame::close(Some(&reply)), deadline)
                    .await;
                self.shared.update(Lifecycle::on_reply_sent);
                result
            }
            CloseAction::Finish => Ok(()),
        };
        info!(
            code = ?close.as_ref().map(|c| c.code.as_u16()),
            "close handshake complete"
        );
        self.shared.finish_locked(&mut writer).await;
        self.assembler.reset();

        result.map(|()| Message::Close(close))
    }

    /// End the connection after a read or dispatch error.
    async fn fail(&mut self, err: Error) -> Result<Option<Message>> {
        self.assembler.reset();

        if err == Error::ConnectionClosed(None) {
            debug!("peer closed the transport");
            self.shared.teardown().await;
            return Ok(None);
        }

        if !err.is_protocol_violation() {
            warn!(error = %err, "transport error");
            self.shared.teardown().await;
            return Err(err);
        }

        warn!(error = %err, code = err.close_code().as_u16(), "protocol violation");
        let mut writer = self.shared.writer.lock().await;
        if self.shared.update(Lifecycle::begin_local_close) {
            let close = CloseFrame::new(err.close_code(), "");
            let deadline = self.shared.grace_deadline();
            if let Err(write_err) = self
                .shared
                .write_until(&mut writer, &Frame::close(Some(&close)), deadline)
                .await
            {
                debug!(error = %write_err, "could not send close frame");
            }
        }
        self.shared.finish_locked(&mut writer).await;
        Err(err)
    }
}
