//! Reassembly of fragmented data messages (RFC 6455 Section 5.4).

use bytes::BytesMut;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{Frame, OpCode};

/// Collects data frames until a frame with FIN=1 completes the message.
///
/// Control frames are not part of a message and are never pushed here; they
/// may arrive between fragments and are handled by the caller.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    fragment_count: usize,
    opcode: Option<OpCode>,
    limits: Limits,
}

impl MessageAssembler {
    pub fn new(limits: Limits) -> Self {
        Self {
            buffer: BytesMut::new(),
            fragment_count: 0,
            opcode: None,
            limits,
        }
    }

    /// Add a data frame to the message being assembled.
    /// Returns the complete message when FIN=1, `None` otherwise.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a continuation with nothing to
    ///   continue, or a new Text/Binary while a message is still open
    /// - `Error::TooManyFragments` / `Error::MessageTooLarge` past the limits
    pub fn push(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        debug_assert!(frame.opcode.is_data());

        if frame.opcode == OpCode::Continuation {
            if self.opcode.is_none() {
                return Err(Error::ProtocolViolation(
                    "Unexpected continuation frame".into(),
                ));
            }
        } else if self.opcode.is_some() {
            return Err(Error::ProtocolViolation(
                "Expected continuation frame".into(),
            ));
        }

        self.limits.check_fragment_count(self.fragment_count + 1)?;
        let new_size = self.buffer.len() + frame.payload().len();
        self.limits.check_message_size(new_size)?;

        // Unfragmented messages skip the buffer entirely.
        if frame.fin && self.opcode.is_none() {
            let opcode = frame.opcode;
            return Ok(Some(AssembledMessage {
                opcode,
                payload: frame.into_payload(),
            }));
        }

        if frame.opcode != OpCode::Continuation {
            self.opcode = Some(frame.opcode);
        }
        self.buffer.extend_from_slice(frame.payload());
        self.fragment_count += 1;

        if !frame.fin {
            return Ok(None);
        }

        let payload = self.buffer.split().to_vec();
        let opcode = self.opcode.take().unwrap_or(OpCode::Binary);
        self.fragment_count = 0;
        Ok(Some(AssembledMessage { opcode, payload }))
    }

    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fragment_count = 0;
        self.opcode = None;
    }
}

/// A fully assembled data message.
#[derive(Debug, PartialEq, Eq)]
pub struct AssembledMessage {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl AssembledMessage {
    /// Convert into the application-facing message.
    ///
    /// A text payload that is not UTF-8 becomes [`Message::InvalidText`]
    /// rather than an error.
    pub fn into_message(self) -> Message {
        match self.opcode {
            OpCode::Text => match String::from_utf8(self.payload) {
                Ok(text) => Message::Text(text),
                Err(err) => Message::InvalidText(err.into_bytes()),
            },
            _ => Message::Binary(self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> Limits {
        Limits::new(1024, 100, 3, 4096)
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = MessageAssembler::new(Limits::default());
        let msg = assembler.push(Frame::text(b"Hello".to_vec())).unwrap().unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert_eq!(msg.payload, b"Hello");
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_two_fragment_message() {
        let mut assembler = MessageAssembler::new(Limits::default());

        let frame1 = Frame::new(false, OpCode::Text, b"Hel".to_vec());
        assert!(assembler.push(frame1).unwrap().is_none());
        assert!(assembler.is_assembling());

        let frame2 = Frame::new(true, OpCode::Continuation, b"lo".to_vec());
        let msg = assembler.push(frame2).unwrap().unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert_eq!(msg.into_message(), Message::Text("Hello".into()));
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_many_fragments() {
        let mut assembler = MessageAssembler::new(Limits::default());

        assert!(assembler.push(Frame::new(false, OpCode::Binary, vec![1, 2])).unwrap().is_none());
        assert!(
            assembler
                .push(Frame::new(false, OpCode::Continuation, vec![3, 4]))
                .unwrap()
                .is_none()
        );
        let msg = assembler
            .push(Frame::new(true, OpCode::Continuation, vec![5, 6]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode, OpCode::Binary);
        assert_eq!(msg.payload, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut assembler = MessageAssembler::new(Limits::default());
        let result = assembler.push(Frame::new(true, OpCode::Continuation, b"x".to_vec()));
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_new_message_while_assembling() {
        let mut assembler = MessageAssembler::new(Limits::default());
        assembler.push(Frame::new(false, OpCode::Text, b"a".to_vec())).unwrap();
        let result = assembler.push(Frame::binary(b"b".to_vec()));
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_max_message_size_exceeded() {
        let mut assembler = MessageAssembler::new(small_limits());
        assembler.push(Frame::new(false, OpCode::Binary, vec![0; 60])).unwrap();
        let result = assembler.push(Frame::new(true, OpCode::Continuation, vec![0; 60]));
        assert_eq!(
            result,
            Err(Error::MessageTooLarge {
                size: 120,
                max: 100
            })
        );
    }

    #[test]
    fn test_max_fragments_exceeded() {
        let mut assembler = MessageAssembler::new(small_limits());
        assembler.push(Frame::new(false, OpCode::Binary, vec![1])).unwrap();
        assembler.push(Frame::new(false, OpCode::Continuation, vec![2])).unwrap();
        assembler.push(Frame::new(false, OpCode::Continuation, vec![3])).unwrap();
        let result = assembler.push(Frame::new(true, OpCode::Continuation, vec![4]));
        assert_eq!(result, Err(Error::TooManyFragments { count: 4, max: 3 }));
    }

    #[test]
    fn test_invalid_utf8_is_delivered_not_rejected() {
        let mut assembler = MessageAssembler::new(Limits::default());
        let msg = assembler
            .push(Frame::text(vec![0xff, 0xfe]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.into_message(), Message::InvalidText(vec![0xff, 0xfe]));
    }

    #[test]
    fn test_reset() {
        let mut assembler = MessageAssembler::new(Limits::default());
        assembler.push(Frame::new(false, OpCode::Text, b"a".to_vec())).unwrap();
        assembler.reset();
        assert!(!assembler.is_assembling());
        assert!(assembler.push(Frame::text(b"b".to_vec())).unwrap().is_some());
    }
}
