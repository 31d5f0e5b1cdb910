use crate::error::WireError;

/// Connection state of a device, as carried on the wire.
///
/// The ordinal is part of the wire format (Census and DiscoveredDevice
/// encode one byte per state) and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Stopped = 0,
    Free = 1,
    Peasant = 2,
    Prince = 3,
    King = 4,
}

impl DeviceState {
    /// Wire ordinal of this state.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Decode a state from its wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Result<Self, WireError> {
        match ordinal {
            0 => Ok(DeviceState::Stopped),
            1 => Ok(DeviceState::Free),
            2 => Ok(DeviceState::Peasant),
            3 => Ok(DeviceState::Prince),
            4 => Ok(DeviceState::King),
            _ => Err(WireError::UnknownState { ordinal }),
        }
    }

    /// True while the device participates in (or rules) a kingdom.
    pub fn is_kingdom_member(self) -> bool {
        matches!(
            self,
            DeviceState::Peasant | DeviceState::Prince | DeviceState::King
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Stopped => "Stopped",
            DeviceState::Free => "Free",
            DeviceState::Peasant => "Peasant",
            DeviceState::Prince => "Prince",
            DeviceState::King => "King",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_roundtrip() {
        for state in [
            DeviceState::Stopped,
            DeviceState::Free,
            DeviceState::Peasant,
            DeviceState::Prince,
            DeviceState::King,
        ] {
            assert_eq!(DeviceState::from_ordinal(state.ordinal()).unwrap(), state);
        }
    }

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(DeviceState::Stopped.ordinal(), 0);
        assert_eq!(DeviceState::Free.ordinal(), 1);
        assert_eq!(DeviceState::Peasant.ordinal(), 2);
        assert_eq!(DeviceState::Prince.ordinal(), 3);
        assert_eq!(DeviceState::King.ordinal(), 4);
    }

    #[test]
    fn unknown_ordinal_rejected() {
        assert!(DeviceState::from_ordinal(5).is_err());
        assert!(DeviceState::from_ordinal(255).is_err());
    }

    #[test]
    fn kingdom_membership() {
        assert!(!DeviceState::Stopped.is_kingdom_member());
        assert!(!DeviceState::Free.is_kingdom_member());
        assert!(DeviceState::Peasant.is_kingdom_member());
        assert!(DeviceState::Prince.is_kingdom_member());
        assert!(DeviceState::King.is_kingdom_member());
    }
}
