use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::frame::{FrameHeader, MAX_HEADER_LEN};
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::validation::FrameValidator;
use crate::protocol::Frame;

/// Read one complete frame from `reader`.
///
/// Reads exactly the two base header bytes, then exactly the extended length
/// and mask key they announce. The header is validated before the payload
/// is read, so an oversized or unmasked frame never causes an allocation.
/// The payload is unmasked in place.
///
/// # Errors
///
/// Any read failure aborts the frame: EOF surfaces as
/// `Error::ConnectionClosed`, other transport errors as `Error::Io`, and
/// validation failures as the matching protocol error. No partial frame is
/// ever returned.
pub async fn read_frame<R>(reader: &mut R, validator: &FrameValidator) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; MAX_HEADER_LEN];
    reader.read_exact(&mut head[..2]).await?;

    let header_len = 2 + FrameHeader::extra_len(head[1]);
    if header_len > 2 {
        reader.read_exact(&mut head[2..header_len]).await?;
    }

    let header = FrameHeader::parse(&head[..header_len])?;
    validator.validate(&header)?;

    let len = usize::try_from(header.payload_len).map_err(|_| Error::FrameTooLarge {
        size: header.payload_len,
        max: validator.limits().max_frame_size,
    })?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    if let Some(mask) = header.mask {
        apply_mask_fast(&mut payload, mask);
    }

    Ok(Frame::from_parts(&header, payload))
}

/// Write side of a connection.
///
/// Frames are always written unmasked. Each frame goes out with a single
/// `write_all` followed by a flush, so two frames never interleave as long as
/// callers serialize access to the writer.
#[derive(Debug)]
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
    shut_down: bool,
}

impl<W> FrameWriter<W> {
    #[must_use]
    pub fn new(io: W, capacity: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(capacity),
            shut_down: false,
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.shut_down {
            return Err(Error::ConnectionClosed(None));
        }

        self.buf.clear();
        frame.write(&mut self.buf, None);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Release the write side. Runs at most once; later calls are no-ops.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.io.shutdown().await?;
        Ok(())
    }
}
