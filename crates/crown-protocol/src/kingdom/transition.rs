use std::fmt;

use crown_wire::DeviceState;

/// Role of a device, without the per-role bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Stopped,
    Free,
    Peasant,
    Prince,
    King,
}

impl StateKind {
    pub fn wire_state(self) -> DeviceState {
        match self {
            StateKind::Stopped => DeviceState::Stopped,
            StateKind::Free => DeviceState::Free,
            StateKind::Peasant => DeviceState::Peasant,
            StateKind::Prince => DeviceState::Prince,
            StateKind::King => DeviceState::King,
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Stopped => "stopped",
            StateKind::Free => "free",
            StateKind::Peasant => "peasant",
            StateKind::Prince => "prince",
            StateKind::King => "king",
        };
        f.write_str(name)
    }
}

/// The static role-transition table. Everything the machine does is a
/// walk along these edges; anything else is a bug.
pub fn transition_allowed(from: StateKind, to: StateKind) -> bool {
    use StateKind::*;
    match from {
        Free => matches!(to, Stopped | Peasant | King),
        Peasant => matches!(to, Stopped | Peasant | Free | Prince),
        Prince => matches!(to, Stopped | Peasant | Free | King),
        King => matches!(to, Stopped | Free | Peasant),
        Stopped => matches!(to, Stopped | Free),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StateKind::*;

    const ALL: [StateKind; 5] = [Stopped, Free, Peasant, Prince, King];

    fn allowed_of(from: StateKind) -> Vec<StateKind> {
        ALL.into_iter()
            .filter(|to| transition_allowed(from, *to))
            .collect()
    }

    #[test]
    fn table_is_exact() {
        assert_eq!(allowed_of(Free), vec![Stopped, Peasant, King]);
        assert_eq!(allowed_of(Peasant), vec![Stopped, Free, Peasant, Prince]);
        assert_eq!(allowed_of(Prince), vec![Stopped, Free, Peasant, King]);
        assert_eq!(allowed_of(King), vec![Stopped, Free, Peasant]);
        assert_eq!(allowed_of(Stopped), vec![Stopped, Free]);
    }

    #[test]
    fn forbidden_edges_are_rejected() {
        assert!(!transition_allowed(Free, Prince));
        assert!(!transition_allowed(Peasant, King));
        assert!(!transition_allowed(King, Prince));
        assert!(!transition_allowed(King, King));
        assert!(!transition_allowed(Stopped, Peasant));
        assert!(!transition_allowed(Stopped, Prince));
        assert!(!transition_allowed(Stopped, King));
    }
}
