//! Frame-level codec driving [`tokio_util::codec::Framed`].
//!
//! The decoder is a two-state machine (header, then payload) that validates
//! everything RFC 6455 allows it to validate at the frame level: reserved
//! bits, opcode range, control frame constraints, the mask/role contract and
//! the declared payload length. Inbound payloads leave the decoder already
//! unmasked; outbound frames are masked by the connection before encoding.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    conn::Role,
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    WebSocketError,
};

/// Decoding state for a frame in flight.
enum ReadState {
    /// The 2 fixed header bytes are parsed; waiting for the extended length
    /// and mask key.
    Header(Header),
    /// The full header is parsed; waiting for the payload.
    Payload(HeaderAndMask),
}

struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// 7-bit length code (126 and 127 select an extended length).
    length_code: u8,
    /// Bytes of extended length still to read (0, 2 or 8).
    extra: usize,
    /// Total remaining header bytes: extended length plus mask key.
    header_size: usize,
}

struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Combined encoder/decoder handed to `Framed`.
pub(crate) struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// `compression` reports whether `permessage-deflate` was negotiated;
    /// without it any RSV1 bit is a protocol violation.
    pub fn new(role: Role, max_payload_size: usize, compression: bool) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_size, compression),
            encoder: Encoder,
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Stateful frame parser.
pub(crate) struct Decoder {
    role: Role,
    state: Option<ReadState>,
    max_payload_size: usize,
    compression: bool,
}

impl Decoder {
    pub fn new(role: Role, max_payload_size: usize, compression: bool) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
            compression,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    if rsv1 {
                        if !self.compression {
                            return Err(WebSocketError::CompressionNotSupported);
                        }
                        // RSV1 marks the first frame of a compressed message
                        // only; continuation and control frames carry it
                        // clear (RFC 7692 Section 6.1).
                        if !opcode.is_data() {
                            return Err(WebSocketError::ReservedBitsNotZero);
                        }
                    }

                    // Every client frame is masked, no server frame is.
                    let mask_expected = self.role == Role::Server;
                    if masked != mask_expected {
                        return Err(WebSocketError::MaskViolation);
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if length_code > 125 {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::MessageTooLarge),
                        },
                        _ => unreachable!(),
                    };

                    // Checked against the declared length so an oversized
                    // frame is rejected before its body is consumed.
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::MessageTooLarge);
                    }

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    src.reserve(payload_len.saturating_sub(src.remaining()));

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(pending)) => {
                    if src.remaining() < pending.payload_len {
                        self.state = Some(ReadState::Payload(pending));
                        return Ok(None);
                    }

                    let mut payload = src.split_to(pending.payload_len);
                    if let Some(mask) = pending.mask {
                        crate::mask::apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(pending.header.fin, pending.header.opcode, payload);
                    frame.compressed = pending.header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes a frame header and payload into the write buffer.
///
/// Masking is the caller's job ([`Frame::mask`]); the encoder emits whatever
/// key the frame carries.
pub(crate) struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
