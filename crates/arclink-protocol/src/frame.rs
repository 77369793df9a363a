//! Length-prefixed, checksummed frames.
//!
//! ```text
//! +-------------+-------------+---------+-----------------+
//! | totalLength |  checksum   | typeTag |     payload     |
//! |   u32 BE    |   u32 BE    |   u8    | totalLength - 5 |
//! +-------------+-------------+---------+-----------------+
//! ```
//!
//! `totalLength` counts everything after itself. The checksum is CRC-32C
//! over `typeTag ‖ payload` and is verified *before* the type tag is looked
//! at: a frame is trusted entirely or not at all.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{FrameError, WireMessage, WireType};

/// Bytes before the type tag: length prefix + checksum.
pub const FRAME_HEADER_LEN: usize = 8;

/// Default upper bound on `totalLength` (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Smallest legal `totalLength`: checksum + type tag, empty payload.
const MIN_TOTAL_LEN: usize = 5;

/// A `tokio_util` codec turning a byte stream into [`WireMessage`]s.
///
/// One instance per connection direction; it holds no state besides the
/// size limit, so it is `Copy`.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Creates a codec that refuses frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// The configured size limit.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = FrameError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek, don't consume: the frame may not be complete yet.
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total < MIN_TOTAL_LEN {
            return Err(FrameError::TooShort(total));
        }
        if total > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max: self.max_frame_bytes,
                got: total,
            });
        }
        if src.len() < 4 + total {
            src.reserve(4 + total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + total);
        frame.advance(4);
        let expected = frame.get_u32();
        let got = crc32c::crc32c(&frame);
        if got != expected {
            return Err(FrameError::ChecksumMismatch { expected, got });
        }

        let ty = WireType::try_from(frame.get_u8())?;
        WireMessage::decode_payload(ty, frame.freeze()).map(Some)
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(
        &mut self,
        item: WireMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        body.put_u8(item.wire_type() as u8);
        item.encode_payload(&mut body);

        let total = body.len() + 4;
        if total > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max: self.max_frame_bytes,
                got: total,
            });
        }

        dst.reserve(4 + total);
        dst.put_u32(total as u32);
        dst.put_u32(crc32c::crc32c(&body));
        dst.extend_from_slice(&body);
        Ok(())
    }
}
