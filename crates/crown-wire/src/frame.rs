use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Current (and only) frame version.
pub const FRAME_VERSION: u8 = 1;

/// Fixed header: version(1) + flags(1) + channel(2) + source(2) + length(2).
pub const FRAME_HEADER_LEN: usize = 8;

/// One tag byte in front of every admin payload.
pub const ADMIN_HEADER_LEN: usize = 1;

/// Largest payload a single frame can carry.
///
/// Anything larger must be chunked by the sender. The admin header is
/// reserved out of the budget so an admin message always fits the same
/// chunk geometry as application payloads.
pub const MAX_PAYLOAD_SIZE: usize = 0xFFFF - FRAME_HEADER_LEN - ADMIN_HEADER_LEN;

/// Channel id used for admin control traffic.
pub const ADMIN_CHANNEL_ID: i16 = -1;

/// Frame type bitfield.
///
/// Bit positions are wire format: 0x02 (keep-alive) and 0x04
/// (broadcast) are externally fixed; the remaining bits are assigned
/// here and must stay consistent across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const HAS_PAYLOAD: FrameFlags = FrameFlags(0x01);
    pub const KEEP_ALIVE: FrameFlags = FrameFlags(0x02);
    pub const BROADCAST: FrameFlags = FrameFlags(0x04);
    pub const ADMIN: FrameFlags = FrameFlags(0x08);
    pub const CHUNK: FrameFlags = FrameFlags(0x10);
    pub const LAST_CHUNK: FrameFlags = FrameFlags(0x20);

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: FrameFlags) -> Self {
        FrameFlags(self.0 | other.0)
    }

    pub fn without(self, other: FrameFlags) -> Self {
        FrameFlags(self.0 & !other.0)
    }
}

/// Decoded frame header, without its payload.
///
/// The receiver reads exactly `FRAME_HEADER_LEN` bytes, decodes this,
/// then reads `payload_len` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub channel_id: i16,
    pub source_id: u16,
    pub payload_len: u16,
}

impl FrameHeader {
    /// Decode a header from exactly `FRAME_HEADER_LEN` bytes.
    pub fn decode(raw: &[u8; FRAME_HEADER_LEN]) -> Result<Self, WireError> {
        let mut buf = &raw[..];
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(WireError::BadVersion { found: version });
        }
        Ok(FrameHeader {
            flags: FrameFlags::from_bits(buf.get_u8()),
            channel_id: buf.get_i16(),
            source_id: buf.get_u16(),
            payload_len: buf.get_u16(),
        })
    }
}

/// Binary envelope — the unit every crown connection reads and writes.
///
/// Layout, big-endian:
/// `[version:1][type:1][channel_id:2][source_id:2][payload_len:2][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub channel_id: i16,
    pub source_id: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Create an application frame. Sets HAS_PAYLOAD when non-empty.
    pub fn new(channel_id: i16, source_id: u16, payload: Bytes) -> Self {
        let mut flags = FrameFlags::empty();
        if !payload.is_empty() {
            flags = flags.with(FrameFlags::HAS_PAYLOAD);
        }
        Frame {
            flags,
            channel_id,
            source_id,
            payload,
        }
    }

    /// Create an empty keep-alive frame.
    pub fn keep_alive(source_id: u16) -> Self {
        Frame {
            flags: FrameFlags::KEEP_ALIVE,
            channel_id: 0,
            source_id,
            payload: Bytes::new(),
        }
    }

    /// Reassemble a frame from a decoded header and its payload bytes.
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Frame {
            flags: header.flags,
            channel_id: header.channel_id,
            source_id: header.source_id,
            payload,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.flags.contains(FrameFlags::KEEP_ALIVE)
    }

    pub fn is_admin(&self) -> bool {
        self.flags.contains(FrameFlags::ADMIN)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(FrameFlags::BROADCAST)
    }

    pub fn is_chunk(&self) -> bool {
        self.flags.contains(FrameFlags::CHUNK)
    }

    pub fn is_last_chunk(&self) -> bool {
        self.flags.contains(FrameFlags::LAST_CHUNK)
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Encode to wire bytes.
    ///
    /// Fails if the payload does not fit a single frame; callers with
    /// larger payloads go through the chunking sender instead.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                len: self.payload.len(),
            });
        }
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.flags.bits());
        buf.put_i16(self.channel_id);
        buf.put_u16(self.source_id);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from a contiguous buffer.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: FRAME_HEADER_LEN,
                available: data.len(),
            });
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&data[..FRAME_HEADER_LEN]);
        let header = FrameHeader::decode(&header_bytes)?;

        let total = FRAME_HEADER_LEN + header.payload_len as usize;
        if data.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                available: data.len(),
            });
        }
        Ok(Frame::from_parts(
            header,
            Bytes::copy_from_slice(&data[FRAME_HEADER_LEN..total]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eight_bytes() {
        assert_eq!(FRAME_HEADER_LEN, 8);
        let frame = Frame::new(3, 7, Bytes::from_static(b"abc"));
        assert_eq!(frame.encode().unwrap().len(), 8 + 3);
    }

    #[test]
    fn max_payload_accounts_for_headers() {
        assert_eq!(MAX_PAYLOAD_SIZE, 0xFFFF - 8 - 1);
    }

    #[test]
    fn encode_layout_is_big_endian() {
        let frame = Frame {
            flags: FrameFlags::HAS_PAYLOAD.with(FrameFlags::BROADCAST),
            channel_id: -2,
            source_id: 0x0102,
            payload: Bytes::from_static(&[0xAA, 0xBB]),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[
                1,          // version
                0x01 | 0x04, // has-payload | broadcast
                0xFF, 0xFE, // channel -2
                0x01, 0x02, // source
                0x00, 0x02, // length
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn roundtrip() {
        let frame = Frame::new(42, 9, Bytes::from(vec![1, 2, 3, 4, 5]));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn keep_alive_roundtrip() {
        let frame = Frame::keep_alive(11);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert!(decoded.is_keep_alive());
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bad_version_rejected() {
        let frame = Frame::new(1, 1, Bytes::from_static(b"x"));
        let mut bytes = frame.encode().unwrap().to_vec();
        bytes[0] = 9;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::BadVersion { found: 9 })
        ));
    }

    #[test]
    fn truncated_rejected() {
        let frame = Frame::new(1, 1, Bytes::from(vec![0u8; 16]));
        let bytes = frame.encode().unwrap();
        assert!(Frame::decode(&bytes[..4]).is_err());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::new(1, 1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            frame.encode(),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn max_payload_accepted() {
        let frame = Frame::new(1, 1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn flag_operations() {
        let flags = FrameFlags::ADMIN.with(FrameFlags::CHUNK);
        assert!(flags.contains(FrameFlags::ADMIN));
        assert!(flags.contains(FrameFlags::CHUNK));
        assert!(!flags.contains(FrameFlags::LAST_CHUNK));
        assert!(!flags.without(FrameFlags::CHUNK).contains(FrameFlags::CHUNK));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn roundtrip_any_frame(
                bits in 0u8..64,
                channel in any::<i16>(),
                source in any::<u16>(),
                payload in proptest::collection::vec(any::<u8>(), 0..512),
            ) {
                let frame = Frame {
                    flags: FrameFlags::from_bits(bits),
                    channel_id: channel,
                    source_id: source,
                    payload: Bytes::from(payload),
                };
                let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded, frame);
            }
        }
    }
}
