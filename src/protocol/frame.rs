//! WebSocket frame parsing and serialization (RFC 6455 Section 5.2).
//!
//! Everything here is pure: decoding works on byte slices and encoding
//! appends to a [`BytesMut`]. The stream-facing reader lives in
//! [`crate::codec`] and reuses [`FrameHeader::parse`].

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::CloseFrame;
use crate::protocol::OpCode;
use crate::protocol::mask::{apply_mask, apply_mask_fast};

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Largest header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Payload length as declared on the wire, all 64 bits.
    pub payload_len: u64,
    /// Total header length in bytes (2 to 14).
    pub header_len: usize,
}

impl FrameHeader {
    /// Number of header bytes that follow the two base bytes, as announced
    /// by the second base byte (extended length plus mask key).
    #[inline]
    #[must_use]
    pub const fn extra_len(byte1: u8) -> usize {
        let ext = match byte1 & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if byte1 & 0x80 != 0 { ext + 4 } else { ext }
    }

    /// Parse a frame header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// - `Error::IncompleteFrame` if not enough data is available
    /// - `Error::ReservedOpcode` if a reserved opcode is used
    /// - `Error::ProtocolViolation` if the 64-bit length has its high bit set
    #[inline]
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame {
                needed: 2 - buf.len(),
            });
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        let fin = (byte0 & 0x80) != 0;
        let rsv1 = (byte0 & 0x40) != 0;
        let rsv2 = (byte0 & 0x20) != 0;
        let rsv3 = (byte0 & 0x10) != 0;
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;

        let masked = (byte1 & 0x80) != 0;
        let header_len = 2 + Self::extra_len(byte1);
        if buf.len() < header_len {
            return Err(Error::IncompleteFrame {
                needed: header_len - buf.len(),
            });
        }

        let (payload_len, mask_offset) = match byte1 & 0x7F {
            126 => (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
            127 => {
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len >> 63 != 0 {
                    return Err(Error::ProtocolViolation(
                        "64-bit payload length has its most significant bit set".into(),
                    ));
                }
                (len, 10)
            }
            short => (u64::from(short), 2),
        };

        let mask = masked.then(|| {
            [
                buf[mask_offset],
                buf[mask_offset + 1],
                buf[mask_offset + 2],
                buf[mask_offset + 3],
            ]
        });

        Ok(Self {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
            payload_len,
            header_len,
        })
    }

    /// Returns `true` if the MASK bit was set.
    #[inline]
    #[must_use]
    pub const fn masked(&self) -> bool {
        self.mask.is_some()
    }
}

/// Append a frame header to `dst`.
///
/// The length field uses the smallest of the three tiers that fits
/// `payload_len`; the MASK bit and key are written iff `mask` is `Some`.
pub fn encode_header(
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: u64,
    dst: &mut BytesMut,
) {
    let mut byte0 = opcode.as_u8();
    if fin {
        byte0 |= 0x80;
    }
    dst.put_u8(byte0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= 125 {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if let Ok(len) = u16::try_from(payload_len) {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(payload_len);
    }

    if let Some(key) = mask {
        dst.put_slice(&key);
    }
}

/// Header length for a payload of `payload_len` bytes.
#[inline]
#[must_use]
pub const fn header_len(payload_len: u64, masked: bool) -> usize {
    let ext = if payload_len <= 125 {
        0
    } else if payload_len <= u16::MAX as u64 {
        2
    } else {
        8
    };
    2 + ext + if masked { 4 } else { 0 }
}

/// A WebSocket frame as defined in RFC 6455.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                         Masking key (if present)              |
/// +---------------------------------------------------------------+
/// |                     Payload data                              |
/// +---------------------------------------------------------------+
/// ```
///
/// The payload is always held unmasked. `mask` records the key a decoded
/// frame arrived with; frames built by the server carry `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag. True if this is the last fragment of a message.
    pub fin: bool,
    /// Reserved bit 1. Must be 0 unless extension is negotiated.
    pub rsv1: bool,
    /// Reserved bit 2. Must be 0 unless extension is negotiated.
    pub rsv2: bool,
    /// Reserved bit 3. Must be 0 unless extension is negotiated.
    pub rsv3: bool,
    /// Frame opcode defining the interpretation of payload data.
    pub opcode: OpCode,
    /// Masking key seen on the wire.
    pub mask: Option<[u8; 4]>,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a new unmasked frame.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload,
        }
    }

    /// Build a frame from a decoded header and its already unmasked payload.
    #[must_use]
    pub fn from_parts(header: &FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            opcode: header.opcode,
            mask: header.mask,
            payload,
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame, with an empty payload when `close` is `None`.
    #[must_use]
    pub fn close(close: Option<&CloseFrame>) -> Self {
        let payload = close.map(CloseFrame::encode).unwrap_or_default();
        Self::new(true, OpCode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Returns `true` if the frame arrived with the MASK bit set.
    #[inline]
    #[must_use]
    pub const fn masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Get the payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Parse a frame from a buffer.
    ///
    /// Returns the parsed frame and the number of bytes consumed. Masked
    /// payloads are unmasked.
    ///
    /// ## Errors
    ///
    /// - `Error::IncompleteFrame` if not enough data is available
    /// - `Error::ReservedOpcode` if a reserved opcode is used
    /// - `Error::FrameTooLarge` if the declared length cannot be addressed
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let header = FrameHeader::parse(buf)?;

        let total_size = usize::try_from(header.payload_len)
            .ok()
            .and_then(|len| len.checked_add(header.header_len))
            .ok_or(Error::FrameTooLarge {
                size: header.payload_len,
                max: usize::MAX as u64,
            })?;

        if buf.len() < total_size {
            return Err(Error::IncompleteFrame {
                needed: total_size - buf.len(),
            });
        }

        let mut payload = buf[header.header_len..total_size].to_vec();
        if let Some(mask) = header.mask {
            apply_mask_fast(&mut payload, mask);
        }

        Ok((Self::from_parts(&header, payload), total_size))
    }

    /// Validate the frame according to RFC 6455.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` if RSV bits are set without extension
    /// - `Error::FragmentedControlFrame` if control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if control frame payload > 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }

        Ok(())
    }

    /// Append the wire form of this frame to `dst`.
    ///
    /// Server frames pass `None`. A key is only supplied when building
    /// client traffic, e.g. in tests.
    pub fn write(&self, dst: &mut BytesMut, mask: Option<[u8; 4]>) {
        dst.reserve(self.wire_size(mask.is_some()));
        let first = dst.len();
        encode_header(self.fin, self.opcode, mask, self.payload.len() as u64, dst);
        dst[first] |= self.rsv_bits();

        let start = dst.len();
        dst.put_slice(&self.payload);
        if let Some(key) = mask {
            apply_mask(&mut dst[start..], key);
        }
    }

    const fn rsv_bits(&self) -> u8 {
        ((self.rsv1 as u8) << 6) | ((self.rsv2 as u8) << 5) | ((self.rsv3 as u8) << 4)
    }

    /// Calculate the size needed to write this frame.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        header_len(self.payload.len() as u64, masked) + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CloseCode;

    fn encode(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.write(&mut buf, mask);
        buf.to_vec()
    }

    #[test]
    fn test_parse_unmasked_text_frame() {
        let data = &[0x81, 0x02, 0x68, 0x69];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 4);
        assert!(frame.fin);
        assert!(!frame.masked());
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"hi");
    }

    #[test]
    fn test_parse_masked_text_frame() {
        let data = &[
            0x81, 0x85, // FIN + Text, MASK + len=5
            0x37, 0xfa, 0x21, 0x3d, // Mask key
            0x7f, 0x9f, 0x4d, 0x51, 0x58, // Masked "Hello"
        ];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 11);
        assert!(frame.masked());
        assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn test_parse_close_frame() {
        let data = &[0x88, 0x04, 0x03, 0xe8, b'O', b'K'];
        let (frame, _) = Frame::parse(data).unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        let close = CloseFrame::parse(frame.payload()).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::Normal);
        assert_eq!(close.reason, "OK");
    }

    #[test]
    fn test_parse_fragmented_frame() {
        let data = &[0x01, 0x03, 0x48, 0x65, 0x6c];
        let (frame, _) = Frame::parse(data).unwrap();
        assert!(!frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"Hel");
    }

    #[test]
    fn test_parse_extended_length_126() {
        let mut data = vec![0x82, 0x7e, 0x01, 0x00];
        data.extend(vec![0xab; 256]);

        let (frame, len) = Frame::parse(&data).unwrap();
        assert_eq!(len, 4 + 256);
        assert_eq!(frame.payload().len(), 256);
        assert!(frame.payload().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_parse_extended_length_127() {
        let mut data = vec![0x82, 0x7f];
        data.extend(65536u64.to_be_bytes());
        data.extend(vec![0xcd; 65536]);

        let (frame, len) = Frame::parse(&data).unwrap();
        assert_eq!(len, 10 + 65536);
        assert_eq!(frame.payload().len(), 65536);
    }

    #[test]
    fn test_header_keeps_full_64_bit_length() {
        // 2^32 + 5 must not collapse to 5.
        let mut data = vec![0x82, 0xff];
        data.extend(((1u64 << 32) + 5).to_be_bytes());
        data.extend([1, 2, 3, 4]);

        let header = FrameHeader::parse(&data).unwrap();
        assert_eq!(header.payload_len, (1u64 << 32) + 5);
        assert_eq!(header.header_len, 14);
        assert_eq!(header.mask, Some([1, 2, 3, 4]));
    }

    #[test]
    fn test_header_rejects_64_bit_length_with_msb_set() {
        let mut data = vec![0x82, 0x7f];
        data.extend(u64::MAX.to_be_bytes());
        assert!(matches!(
            FrameHeader::parse(&data),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_extra_len() {
        assert_eq!(FrameHeader::extra_len(0x05), 0);
        assert_eq!(FrameHeader::extra_len(0x85), 4);
        assert_eq!(FrameHeader::extra_len(0x7e), 2);
        assert_eq!(FrameHeader::extra_len(0xfe), 6);
        assert_eq!(FrameHeader::extra_len(0x7f), 8);
        assert_eq!(FrameHeader::extra_len(0xff), 12);
    }

    #[test]
    fn test_parse_empty_payload() {
        let (frame, len) = Frame::parse(&[0x81, 0x00]).unwrap();
        assert_eq!(len, 2);
        assert_eq!(frame.payload(), b"");
    }

    #[test]
    fn test_validate_fragmented_control_frame() {
        let mut frame = Frame::ping(b"test".to_vec());
        frame.fin = false;
        assert_eq!(frame.validate(), Err(Error::FragmentedControlFrame));
    }

    #[test]
    fn test_validate_control_frame_too_large() {
        let frame = Frame::ping(vec![0u8; 126]);
        assert_eq!(frame.validate(), Err(Error::ControlFrameTooLarge(126)));
        assert!(Frame::ping(vec![0u8; 125]).validate().is_ok());
    }

    #[test]
    fn test_parse_rsv_bits_set() {
        let (frame, _) = Frame::parse(&[0xc1, 0x00]).unwrap();
        assert!(frame.rsv1);
        assert_eq!(frame.validate(), Err(Error::ReservedBitsSet));
    }

    #[test]
    fn test_parse_reserved_opcodes() {
        assert_eq!(Frame::parse(&[0x83, 0x00]), Err(Error::ReservedOpcode(0x03)));
        assert_eq!(Frame::parse(&[0x8b, 0x00]), Err(Error::ReservedOpcode(0x0B)));
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(Frame::parse(&[0x81]), Err(Error::IncompleteFrame { needed: 1 }));
        assert_eq!(
            Frame::parse(&[0x81, 0x05, 0x48, 0x65, 0x6c]),
            Err(Error::IncompleteFrame { needed: 2 })
        );
        assert_eq!(
            Frame::parse(&[0x82, 0x7e, 0x01]),
            Err(Error::IncompleteFrame { needed: 1 })
        );
        assert_eq!(
            Frame::parse(&[0x82, 0x7f, 0x00, 0x00, 0x00]),
            Err(Error::IncompleteFrame { needed: 5 })
        );
        assert!(matches!(
            Frame::parse(&[0x81, 0x85, 0x37, 0xfa]),
            Err(Error::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_write_unmasked_text_frame() {
        let bytes = encode(&Frame::text(b"hi".to_vec()), None);
        assert_eq!(bytes, [0x81, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn test_write_masked_text_frame() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let bytes = encode(&Frame::text(b"Hello".to_vec()), Some(mask));
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x85);
        assert_eq!(&bytes[2..6], &mask);
        assert_eq!(&bytes[6..11], &[0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_write_length_tiers() {
        let bytes = encode(&Frame::binary(vec![0u8; 125]), None);
        assert_eq!(bytes[1], 125);
        assert_eq!(bytes.len(), 2 + 125);

        let bytes = encode(&Frame::binary(vec![0u8; 126]), None);
        assert_eq!(&bytes[1..4], &[0x7e, 0x00, 0x7e]);
        assert_eq!(bytes.len(), 4 + 126);

        let bytes = encode(&Frame::binary(vec![0u8; 65535]), None);
        assert_eq!(&bytes[1..4], &[0x7e, 0xff, 0xff]);

        let bytes = encode(&Frame::binary(vec![0u8; 65536]), None);
        assert_eq!(bytes[1], 0x7f);
        assert_eq!(&bytes[2..10], &65536u64.to_be_bytes());
        assert_eq!(bytes.len(), 10 + 65536);
    }

    #[test]
    fn test_encode_header_64_bit_tier() {
        let mut buf = BytesMut::new();
        encode_header(true, OpCode::Binary, None, 1 << 32, &mut buf);
        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], 0x7f);
        assert_eq!(&buf[2..10], &(1u64 << 32).to_be_bytes());
        assert_eq!(buf.len(), header_len(1 << 32, false));

        let header = FrameHeader::parse(&buf).unwrap();
        assert_eq!(header.payload_len, 1 << 32);
        assert!(header.fin);
        assert!(!header.masked());
    }

    #[test]
    fn test_roundtrip_unmasked() {
        let original = Frame::text(b"WebSocket roundtrip test!".to_vec());
        let bytes = encode(&original, None);
        let (parsed, consumed) = Frame::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_roundtrip_masked() {
        let original = Frame::new(false, OpCode::Binary, b"Masked roundtrip".to_vec());
        let mask = [0x12, 0x34, 0x56, 0x78];
        let bytes = encode(&original, Some(mask));
        let (parsed, _) = Frame::parse(&bytes).unwrap();
        assert_eq!(parsed.payload(), original.payload());
        assert_eq!(parsed.fin, original.fin);
        assert_eq!(parsed.mask, Some(mask));
    }

    #[test]
    fn test_wire_size() {
        let frame = Frame::text(b"Hello".to_vec());
        assert_eq!(frame.wire_size(false), 7);
        assert_eq!(frame.wire_size(true), 11);

        let frame = Frame::binary(vec![0u8; 256]);
        assert_eq!(frame.wire_size(false), 260);

        let frame = Frame::binary(vec![0u8; 65536]);
        assert_eq!(frame.wire_size(false), 65546);
        assert_eq!(frame.wire_size(true), 65550);
    }

    #[test]
    fn test_close_frame_constructor() {
        let close = CloseFrame::new(CloseCode::Normal, "OK");
        let bytes = encode(&Frame::close(Some(&close)), None);
        assert_eq!(bytes, [0x88, 0x04, 0x03, 0xe8, b'O', b'K']);

        let bytes = encode(&Frame::close(None), None);
        assert_eq!(bytes, [0x88, 0x00]);
    }

    #[test]
    fn test_payload_exceeds_addressable_size() {
        let mut data = vec![0x82, 0xFF];
        data.extend_from_slice(&(i64::MAX as u64).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        assert!(Frame::parse(&data).is_err());
    }

    #[test]
    fn test_write_keeps_reserved_bits() {
        let mut frame = Frame::binary(vec![1, 2, 3]);
        frame.rsv1 = true;
        frame.rsv3 = true;

        let bytes = encode(&frame, Some([1, 2, 3, 4]));
        assert_eq!(bytes[0], 0x80 | 0x40 | 0x10 | 0x02);

        let (parsed, _) = Frame::parse(&bytes).unwrap();
        assert!(parsed.rsv1 && !parsed.rsv2 && parsed.rsv3);
        assert_eq!(parsed.payload(), &[1, 2, 3]);
        assert_eq!(parsed.validate(), Err(Error::ReservedBitsSet));
    }
}
