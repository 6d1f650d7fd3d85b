// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outer framing: `u32 BE length || body` over any byte stream, with
//! per-frame protocol discrimination so a v2 helper can answer a v3 probe
//! and the session simply continues in v2.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::v2::V2Command;
use crate::v3::V3Frame;
use crate::DecodeError;

/// Frames larger than this are protocol errors, not allocations.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// One decoded frame of either generation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    V3(V3Frame),
    V2(V2Command),
}

/// Length-prefixed frame codec for `tokio_util` framed streams.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, FrameError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                if len > MAX_FRAME {
                    return Err(DecodeError::FrameTooLarge(len).into());
                }
                src.advance(4);
                src.reserve(len);
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len {
            return Ok(None);
        }

        let body = src.split_to(len);
        self.pending_len = None;

        if body.is_empty() {
            return Err(DecodeError::Truncated.into());
        }

        // v3 command ids stay under 256, so the high command byte is zero;
        // a v2 protobuf envelope always leads with the field-1 tag.
        match body[0] {
            0x00 => Ok(Some(WireFrame::V3(V3Frame::decode(&body)?))),
            0x0A => Ok(Some(WireFrame::V2(V2Command::decode(&body)?))),
            other => Err(DecodeError::UnknownProtocol(other).into()),
        }
    }
}

impl Encoder<WireFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: WireFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut body = Vec::new();
        match frame {
            WireFrame::V3(f) => f.encode(&mut body),
            WireFrame::V2(c) => c.encode(&mut body),
        }

        if body.len() > MAX_FRAME {
            return Err(DecodeError::FrameTooLarge(body.len()).into());
        }

        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v3::{V3Payload, CODE_OK};

    #[test]
    fn test_v3_roundtrip_through_codec() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = WireFrame::V3(
            V3Payload::OpenReq {
                definition: "wlan0".to_string(),
            }
            .into_frame(12, CODE_OK),
        );

        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_v2_roundtrip_through_codec() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = WireFrame::V2(V2Command::new("KDSPROBESOURCE", vec![0x08, 0x01]));
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_partial_frames_wait() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = WireFrame::V3(V3Payload::Ping.into_frame(1, CODE_OK));
        let mut wire = BytesMut::new();
        codec.encode(frame.clone(), &mut wire).unwrap();

        // Byte-at-a-time delivery
        let mut decoded = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(d) = codec.decode(&mut buf).unwrap() {
                decoded = Some(d);
            }
        }
        assert_eq!(decoded.unwrap(), frame);
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(WireFrame::V3(V3Payload::Ping.into_frame(1, CODE_OK)), &mut buf)
            .unwrap();
        codec
            .encode(WireFrame::V3(V3Payload::Pong.into_frame(2, CODE_OK)), &mut buf)
            .unwrap();

        let a = codec.decode(&mut buf).unwrap().unwrap();
        let b = codec.decode(&mut buf).unwrap().unwrap();
        match (a, b) {
            (WireFrame::V3(a), WireFrame::V3(b)) => {
                assert_eq!(a.seqno, 1);
                assert_eq!(b.seqno, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_garbage_protocol_byte() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[0xFF, 0x00, 0x00, 0x00]);
        match codec.decode(&mut buf) {
            Err(FrameError::Decode(DecodeError::UnknownProtocol(0xFF))) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
