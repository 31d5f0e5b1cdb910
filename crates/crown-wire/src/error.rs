/// Wire-level errors for crown.
///
/// Covers frame framing violations and admin-message decoding.
/// A decode error on a live connection means the peer is speaking
/// a different protocol (or the stream desynced) — callers drop the
/// message and may tear the connection down.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported frame version {found}")]
    BadVersion { found: u8 },

    #[error("payload of {len} bytes exceeds the single-frame maximum")]
    PayloadTooLarge { len: usize },

    #[error("string of {len} bytes exceeds the u16 length prefix")]
    StringTooLong { len: usize },

    #[error("unknown admin message tag {tag}")]
    UnknownAdminTag { tag: u8 },

    #[error("malformed admin message: {reason}")]
    MalformedAdmin { reason: String },

    #[error("unknown device state ordinal {ordinal}")]
    UnknownState { ordinal: u8 },

    #[error("frame is not an admin frame")]
    NotAdmin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncated() {
        let err = WireError::Truncated {
            needed: 8,
            available: 3,
        };
        assert_eq!(err.to_string(), "truncated frame: need 8 bytes, have 3");
    }

    #[test]
    fn display_bad_version() {
        let err = WireError::BadVersion { found: 7 };
        assert_eq!(err.to_string(), "unsupported frame version 7");
    }

    #[test]
    fn display_unknown_tag() {
        let err = WireError::UnknownAdminTag { tag: 200 };
        assert_eq!(err.to_string(), "unknown admin message tag 200");
    }
}
