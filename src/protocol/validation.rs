//! Inbound frame checks for the server role (RFC 6455 Sections 5.1, 5.2, 5.5).
//!
//! All checks run on the decoded header, so a frame is refused before any of
//! its payload is read or allocated.

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::protocol::frame::{FrameHeader, MAX_CONTROL_FRAME_PAYLOAD};

/// Validator for frames arriving from a client.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    limits: Limits,
    accept_unmasked_frames: bool,
}

impl FrameValidator {
    /// Create a validator that enforces client masking.
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            accept_unmasked_frames: false,
        }
    }

    /// Accept unmasked frames (not RFC compliant).
    pub fn with_accept_unmasked(mut self, accept: bool) -> Self {
        self.accept_unmasked_frames = accept;
        self
    }

    /// Limits this validator enforces.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Validate a decoded header.
    ///
    /// Checks run in this order: masking, RSV bits, control frame rules,
    /// declared payload length.
    ///
    /// # Errors
    ///
    /// - `Error::UnmaskedClientFrame` - client sent an unmasked frame
    /// - `Error::ReservedBitsSet` - RSV bits set without negotiated extension
    /// - `Error::FragmentedControlFrame` - control frame with FIN=0
    /// - `Error::ControlFrameTooLarge` - control frame longer than 125 bytes
    /// - `Error::FrameTooLarge` - declared length exceeds `max_frame_size`
    pub fn validate(&self, header: &FrameHeader) -> Result<()> {
        if !header.masked() && !self.accept_unmasked_frames {
            return Err(Error::UnmaskedClientFrame);
        }

        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if header.payload_len > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(Error::ControlFrameTooLarge(
                    usize::try_from(header.payload_len).unwrap_or(usize::MAX),
                ));
            }
        }

        self.limits.check_frame_size(header.payload_len)
    }
}
