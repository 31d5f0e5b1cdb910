//! The kingdom state machine.
//!
//! Pure logic: [`KingdomMachine`] consumes discovery sightings, admin
//! messages, connection events, commands and timer ticks, and returns
//! [`KingdomEffect`]s for the runtime to execute. No I/O happens here,
//! which is what makes every election scenario unit-testable.

mod effect;
mod machine;
mod transition;

pub use effect::{KingdomEffect, LifecycleEvent, TransitionReason};
pub use machine::KingdomMachine;
pub use transition::{transition_allowed, StateKind};
