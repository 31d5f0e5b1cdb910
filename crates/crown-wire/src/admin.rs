use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::{Frame, FrameFlags, ADMIN_CHANNEL_ID};
use crate::types::DeviceState;

/// Admin message tag bytes. Closed set — unknown tags are a protocol
/// violation, never a fall-through.
mod tag {
    pub const CENSUS: u8 = 1;
    pub const PRONOUNCE_PRINCE: u8 = 2;
    pub const ACK_PRONOUNCE_PRINCE: u8 = 3;
    pub const BOW_DOWN_TO_NEW_KING: u8 = 4;
    pub const PRINCE_FOUND_A_KING: u8 = 5;
    pub const DISCOVERED_DEVICE: u8 = 6;
    pub const SERVER_CONNECTION_AVAILABLE: u8 = 7;
    pub const SERVER_CONNECTION_DOWN: u8 = 8;
    pub const CLOSE_RELAY_CONNECTION: u8 = 9;
    pub const RELAY: u8 = 10;
    pub const TEXT: u8 = 11;
    pub const ADD_SUBSCRIPTION: u8 = 12;
    pub const REMOVE_SUBSCRIPTION: u8 = 13;
}

/// Typed control message carried as the payload of an admin frame.
///
/// One message per protocol event; ephemeral. Encoding is
/// `[tag:1][fields...]` with u16-BE-length-prefixed UTF-8 strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    /// Periodic kingdom roll call: every known device and its state.
    Census { states: BTreeMap<String, DeviceState> },
    /// King designates a Prince.
    PronouncePrince { prince_id: String },
    /// Prince accepts the pronouncement.
    AckPronouncePrince { prince_id: String },
    /// Losing King orders its subjects to migrate to the winner.
    BowDownToNewKing { new_king_id: String },
    /// Prince relays a competing-kingdom sighting to its King.
    PrinceFoundAKing { king_id: String },
    /// A beacon sighting forwarded into the kingdom.
    DiscoveredDevice {
        device_id: String,
        state: DeviceState,
    },
    /// A mediator gained connectivity to the external server.
    ServerConnectionAvailable { mediator_id: String },
    /// The mediator lost its server connection.
    ServerConnectionDown,
    /// Tear down a relay tunnel.
    CloseRelayConnection,
    /// Opaque inner frame tunneled between mediator and server.
    Relay { raw: Bytes },
    /// Free-form text, used for protocol-level debugging.
    Text { text: String },
    /// Register a subscriber for a channel at the King.
    AddSubscription { channel_id: i16, device_id: String },
    /// Remove a subscriber for a channel at the King.
    RemoveSubscription { channel_id: i16, device_id: String },
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), WireError> {
    // The length prefix is two bytes; a longer string would encode
    // with a silently wrapped length and desync the decoder.
    if s.len() > u16::MAX as usize {
        return Err(WireError::StringTooLong { len: s.len() });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut impl Buf) -> Result<String, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::MalformedAdmin {
            reason: "missing string length".into(),
        });
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(WireError::MalformedAdmin {
            reason: format!("string of {len} bytes truncated"),
        });
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::MalformedAdmin {
        reason: "string is not valid UTF-8".into(),
    })
}

impl AdminMessage {
    /// Wire tag of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            AdminMessage::Census { .. } => tag::CENSUS,
            AdminMessage::PronouncePrince { .. } => tag::PRONOUNCE_PRINCE,
            AdminMessage::AckPronouncePrince { .. } => tag::ACK_PRONOUNCE_PRINCE,
            AdminMessage::BowDownToNewKing { .. } => tag::BOW_DOWN_TO_NEW_KING,
            AdminMessage::PrinceFoundAKing { .. } => tag::PRINCE_FOUND_A_KING,
            AdminMessage::DiscoveredDevice { .. } => tag::DISCOVERED_DEVICE,
            AdminMessage::ServerConnectionAvailable { .. } => tag::SERVER_CONNECTION_AVAILABLE,
            AdminMessage::ServerConnectionDown => tag::SERVER_CONNECTION_DOWN,
            AdminMessage::CloseRelayConnection => tag::CLOSE_RELAY_CONNECTION,
            AdminMessage::Relay { .. } => tag::RELAY,
            AdminMessage::Text { .. } => tag::TEXT,
            AdminMessage::AddSubscription { .. } => tag::ADD_SUBSCRIPTION,
            AdminMessage::RemoveSubscription { .. } => tag::REMOVE_SUBSCRIPTION,
        }
    }

    /// Encode to `[tag][fields...]` bytes. Errors when a string field
    /// cannot fit its u16 length prefix.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag());
        match self {
            AdminMessage::Census { states } => {
                // BTreeMap iteration gives device-id order: deterministic bytes.
                for (device_id, state) in states {
                    put_str(&mut buf, device_id)?;
                    buf.put_u8(state.ordinal());
                }
            }
            AdminMessage::PronouncePrince { prince_id }
            | AdminMessage::AckPronouncePrince { prince_id } => {
                put_str(&mut buf, prince_id)?;
            }
            AdminMessage::BowDownToNewKing { new_king_id } => {
                put_str(&mut buf, new_king_id)?;
            }
            AdminMessage::PrinceFoundAKing { king_id } => {
                put_str(&mut buf, king_id)?;
            }
            AdminMessage::DiscoveredDevice { device_id, state } => {
                put_str(&mut buf, device_id)?;
                buf.put_u8(state.ordinal());
            }
            AdminMessage::ServerConnectionAvailable { mediator_id } => {
                put_str(&mut buf, mediator_id)?;
            }
            AdminMessage::ServerConnectionDown | AdminMessage::CloseRelayConnection => {}
            AdminMessage::Relay { raw } => {
                buf.put_slice(raw);
            }
            AdminMessage::Text { text } => {
                put_str(&mut buf, text)?;
            }
            AdminMessage::AddSubscription {
                channel_id,
                device_id,
            }
            | AdminMessage::RemoveSubscription {
                channel_id,
                device_id,
            } => {
                buf.put_i16(*channel_id);
                put_str(&mut buf, device_id)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decode from `[tag][fields...]` bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(WireError::MalformedAdmin {
                reason: "empty admin payload".into(),
            });
        }
        let tag_byte = buf.get_u8();
        match tag_byte {
            tag::CENSUS => {
                let mut states = BTreeMap::new();
                while buf.has_remaining() {
                    let device_id = get_str(&mut buf)?;
                    if !buf.has_remaining() {
                        return Err(WireError::MalformedAdmin {
                            reason: "census entry missing state byte".into(),
                        });
                    }
                    let state = DeviceState::from_ordinal(buf.get_u8())?;
                    states.insert(device_id, state);
                }
                Ok(AdminMessage::Census { states })
            }
            tag::PRONOUNCE_PRINCE => Ok(AdminMessage::PronouncePrince {
                prince_id: get_str(&mut buf)?,
            }),
            tag::ACK_PRONOUNCE_PRINCE => Ok(AdminMessage::AckPronouncePrince {
                prince_id: get_str(&mut buf)?,
            }),
            tag::BOW_DOWN_TO_NEW_KING => Ok(AdminMessage::BowDownToNewKing {
                new_king_id: get_str(&mut buf)?,
            }),
            tag::PRINCE_FOUND_A_KING => Ok(AdminMessage::PrinceFoundAKing {
                king_id: get_str(&mut buf)?,
            }),
            tag::DISCOVERED_DEVICE => {
                let device_id = get_str(&mut buf)?;
                if !buf.has_remaining() {
                    return Err(WireError::MalformedAdmin {
                        reason: "discovered device missing state byte".into(),
                    });
                }
                let state = DeviceState::from_ordinal(buf.get_u8())?;
                Ok(AdminMessage::DiscoveredDevice { device_id, state })
            }
            tag::SERVER_CONNECTION_AVAILABLE => Ok(AdminMessage::ServerConnectionAvailable {
                mediator_id: get_str(&mut buf)?,
            }),
            tag::SERVER_CONNECTION_DOWN => Ok(AdminMessage::ServerConnectionDown),
            tag::CLOSE_RELAY_CONNECTION => Ok(AdminMessage::CloseRelayConnection),
            tag::RELAY => Ok(AdminMessage::Relay {
                raw: Bytes::copy_from_slice(buf),
            }),
            tag::TEXT => Ok(AdminMessage::Text {
                text: get_str(&mut buf)?,
            }),
            tag::ADD_SUBSCRIPTION | tag::REMOVE_SUBSCRIPTION => {
                if buf.remaining() < 2 {
                    return Err(WireError::MalformedAdmin {
                        reason: "subscription missing channel id".into(),
                    });
                }
                let channel_id = buf.get_i16();
                let device_id = get_str(&mut buf)?;
                if tag_byte == tag::ADD_SUBSCRIPTION {
                    Ok(AdminMessage::AddSubscription {
                        channel_id,
                        device_id,
                    })
                } else {
                    Ok(AdminMessage::RemoveSubscription {
                        channel_id,
                        device_id,
                    })
                }
            }
            other => Err(WireError::UnknownAdminTag { tag: other }),
        }
    }

    /// Wrap this message into an admin frame.
    ///
    /// Only valid for messages that fit one frame; the chunking sender
    /// handles oversized payloads (a very large Census, say).
    pub fn to_frame(&self, source_id: u16) -> Result<Frame, WireError> {
        let payload = self.encode()?;
        if payload.len() > crate::frame::MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge { len: payload.len() });
        }
        let mut frame = Frame::new(ADMIN_CHANNEL_ID, source_id, payload);
        frame.flags = frame.flags.with(FrameFlags::ADMIN);
        Ok(frame)
    }

    /// Parse an admin message back out of a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        if !frame.is_admin() {
            return Err(WireError::NotAdmin);
        }
        AdminMessage::decode(&frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: AdminMessage) {
        let decoded = AdminMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn census_roundtrip() {
        let mut states = BTreeMap::new();
        states.insert("alpha".to_string(), DeviceState::King);
        states.insert("bravo".to_string(), DeviceState::Prince);
        states.insert("charlie".to_string(), DeviceState::Peasant);
        roundtrip(AdminMessage::Census { states });
    }

    #[test]
    fn empty_census_roundtrip() {
        roundtrip(AdminMessage::Census {
            states: BTreeMap::new(),
        });
    }

    #[test]
    fn prince_messages_roundtrip() {
        roundtrip(AdminMessage::PronouncePrince {
            prince_id: "bravo".into(),
        });
        roundtrip(AdminMessage::AckPronouncePrince {
            prince_id: "bravo".into(),
        });
        roundtrip(AdminMessage::PrinceFoundAKing {
            king_id: "delta".into(),
        });
    }

    #[test]
    fn merge_and_discovery_roundtrip() {
        roundtrip(AdminMessage::BowDownToNewKing {
            new_king_id: "alpha".into(),
        });
        roundtrip(AdminMessage::DiscoveredDevice {
            device_id: "echo".into(),
            state: DeviceState::Free,
        });
    }

    #[test]
    fn relay_messages_roundtrip() {
        roundtrip(AdminMessage::ServerConnectionAvailable {
            mediator_id: "mediator-1".into(),
        });
        roundtrip(AdminMessage::ServerConnectionDown);
        roundtrip(AdminMessage::CloseRelayConnection);
        roundtrip(AdminMessage::Relay {
            raw: Bytes::from_static(&[1, 0, 8, 255, 42]),
        });
    }

    #[test]
    fn text_and_subscription_roundtrip() {
        roundtrip(AdminMessage::Text {
            text: "hello kingdom".into(),
        });
        roundtrip(AdminMessage::AddSubscription {
            channel_id: 7,
            device_id: "alpha".into(),
        });
        roundtrip(AdminMessage::RemoveSubscription {
            channel_id: -3,
            device_id: "bravo".into(),
        });
    }

    #[test]
    fn relay_wraps_inner_frame_without_reparse() {
        // A relay message tunnels a full inner frame byte-exact.
        let inner = Frame::new(5, 2, Bytes::from_static(b"payload")).encode().unwrap();
        let msg = AdminMessage::Relay { raw: inner.clone() };
        let decoded = AdminMessage::decode(&msg.encode().unwrap()).unwrap();
        let AdminMessage::Relay { raw } = decoded else {
            panic!("wrong variant");
        };
        assert_eq!(raw, inner);
        // And the inner frame is still parseable by the far side.
        assert!(Frame::decode(&raw).is_ok());
    }

    #[test]
    fn frame_wrapping() {
        let msg = AdminMessage::Text { text: "hi".into() };
        let frame = msg.to_frame(3).unwrap();
        assert!(frame.is_admin());
        assert_eq!(frame.channel_id, ADMIN_CHANNEL_ID);
        assert_eq!(AdminMessage::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn non_admin_frame_rejected() {
        let frame = Frame::new(1, 1, Bytes::from_static(b"app data"));
        assert!(matches!(
            AdminMessage::from_frame(&frame),
            Err(WireError::NotAdmin)
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            AdminMessage::decode(&[99]),
            Err(WireError::UnknownAdminTag { tag: 99 })
        ));
    }

    #[test]
    fn string_at_the_length_prefix_limit_roundtrips() {
        roundtrip(AdminMessage::Text {
            text: "x".repeat(u16::MAX as usize),
        });
    }

    #[test]
    fn overlong_string_is_rejected_on_encode() {
        let msg = AdminMessage::Text {
            text: "x".repeat(u16::MAX as usize + 1),
        };
        assert!(matches!(
            msg.encode(),
            Err(WireError::StringTooLong { len }) if len == u16::MAX as usize + 1
        ));
        // The same field inside a census entry is caught too.
        let mut states = BTreeMap::new();
        states.insert("y".repeat(u16::MAX as usize + 1), DeviceState::Free);
        assert!(matches!(
            AdminMessage::Census { states }.encode(),
            Err(WireError::StringTooLong { .. })
        ));
    }

    #[test]
    fn truncated_census_rejected() {
        let mut states = BTreeMap::new();
        states.insert("alpha".to_string(), DeviceState::King);
        let bytes = AdminMessage::Census { states }.encode().unwrap();
        // Drop the trailing state byte.
        assert!(AdminMessage::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn arb_state() -> impl Strategy<Value = DeviceState> {
            prop_oneof![
                Just(DeviceState::Stopped),
                Just(DeviceState::Free),
                Just(DeviceState::Peasant),
                Just(DeviceState::Prince),
                Just(DeviceState::King),
            ]
        }

        proptest! {
            #[test]
            fn census_roundtrip_any(
                entries in proptest::collection::btree_map("[a-z0-9:.-]{1,64}", arb_state(), 0..32)
            ) {
                let msg = AdminMessage::Census { states: entries };
                prop_assert_eq!(AdminMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
            }

            #[test]
            fn text_roundtrip_any(text in "\\PC{0,200}") {
                let msg = AdminMessage::Text { text };
                prop_assert_eq!(AdminMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
            }
        }
    }
}
