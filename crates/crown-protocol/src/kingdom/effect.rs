use crown_wire::AdminMessage;

use super::transition::StateKind;
use crate::channel::ChannelMode;
use crate::types::DeviceId;

/// Why a role change happened. Carried on every
/// [`LifecycleEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    Stopped,
    /// Connected to a King as an ordinary member.
    JoinedKingdom,
    /// A Free device accepted its first subject.
    AcceptedFirstPeasant,
    /// A Free device found nobody to join and crowned itself.
    FoundedKingdom,
    /// The King named us heir and we acknowledged.
    Pronounced,
    /// The King named someone else heir.
    Demoted,
    /// The heir promoted itself after the King vanished.
    Crowned,
    /// Upstream connection to the King went down.
    KingConnectionLost,
    /// A Peasant reconnected to the remembered heir after King loss.
    FollowedTheHeirToTheThrone,
    /// Lost a kingdom merge and joined the winning King.
    BowedDown,
    /// A King with no subjects gave up the crown.
    SteppedDown,
}

/// Application-visible protocol events, derived from role transitions
/// and Census diffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// We are part of a kingdom (as King, or connected to one).
    Connected { king: DeviceId },
    /// We are no longer part of any kingdom.
    Disconnected,
    DeviceJoined { device: DeviceId },
    DeviceLeft { device: DeviceId },
    KingChanged {
        old: Option<DeviceId>,
        new: Option<DeviceId>,
    },
    PrinceChanged {
        old: Option<DeviceId>,
        new: Option<DeviceId>,
    },
    StateChanged {
        from: StateKind,
        to: StateKind,
        reason: TransitionReason,
    },
}

/// One instruction from the machine to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KingdomEffect {
    SendAdmin {
        to: DeviceId,
        message: AdminMessage,
    },
    /// Deliver to every connection and loop back to ourselves.
    BroadcastAdmin { message: AdminMessage },
    /// Dial a device (backoff handled by the connection manager).
    Connect { device: DeviceId },
    Disconnect { device: DeviceId },
    DisconnectAll,
    SetChannelMode { mode: ChannelMode },
    Emit(LifecycleEvent),
}
