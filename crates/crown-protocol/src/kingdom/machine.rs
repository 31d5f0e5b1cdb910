use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crown_wire::{AdminMessage, DeviceState};

use super::effect::{KingdomEffect, LifecycleEvent, TransitionReason};
use super::transition::{transition_allowed, StateKind};
use crate::channel::ChannelMode;
use crate::config::CrownConfig;
use crate::types::DeviceId;

// ── Per-role bookkeeping ────────────────────────────────────────────

#[derive(Debug, Default)]
struct FreeData {
    /// Device we are currently dialing, if any.
    connecting_to: Option<DeviceId>,
    /// Why the pending dial, shown on the resulting transition.
    join_reason: Option<TransitionReason>,
    /// Remembered heir after a lost King, and when to dial it.
    follow_heir: Option<(DeviceId, u64)>,
    /// When to crown a kingdom of one if nothing turns up.
    self_crown_at: Option<u64>,
}

#[derive(Debug)]
struct PeasantData {
    king: DeviceId,
    prince: Option<DeviceId>,
    census: BTreeMap<String, DeviceState>,
}

#[derive(Debug)]
struct PrinceData {
    king: DeviceId,
    /// None while the upstream connection is up; the crowning clock
    /// once it went down.
    crowning_deadline: Option<u64>,
    /// Followers that connected before we actually crowned.
    early_peasants: BTreeSet<DeviceId>,
    census: BTreeMap<String, DeviceState>,
}

#[derive(Debug, Default)]
struct KingData {
    peasants: BTreeSet<DeviceId>,
    prince: Option<DeviceId>,
    /// Candidate we pronounced and the ack deadline.
    pending_pronounce: Option<(DeviceId, u64)>,
    /// Candidates that failed to ack this round.
    declined: BTreeSet<DeviceId>,
    lonely_since: Option<u64>,
    /// Merge loser bookkeeping: the winner and the migration deadline.
    bowing_down_to: Option<(DeviceId, u64)>,
    next_census_at: u64,
}

#[derive(Debug)]
enum StateData {
    Stopped,
    Free(FreeData),
    Peasant(PeasantData),
    Prince(PrinceData),
    King(KingData),
}

impl StateData {
    fn kind(&self) -> StateKind {
        match self {
            StateData::Stopped => StateKind::Stopped,
            StateData::Free(_) => StateKind::Free,
            StateData::Peasant(_) => StateKind::Peasant,
            StateData::Prince(_) => StateKind::Prince,
            StateData::King(_) => StateKind::King,
        }
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ── Machine ─────────────────────────────────────────────────────────

/// Role logic for one device.
///
/// Every handler takes the current time in milliseconds and returns
/// the effects the runtime must execute; the machine itself never
/// performs I/O. Handlers must be called from a single task.
pub struct KingdomMachine {
    local: DeviceId,
    config: CrownConfig,
    state: StateData,
}

impl KingdomMachine {
    pub fn new(local: DeviceId, config: CrownConfig) -> Self {
        KingdomMachine {
            local,
            config,
            state: StateData::Stopped,
        }
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    pub fn state(&self) -> StateKind {
        self.state.kind()
    }

    /// The King we answer to; ourselves while King, None otherwise.
    pub fn king(&self) -> Option<DeviceId> {
        match &self.state {
            StateData::Peasant(data) => Some(data.king.clone()),
            StateData::Prince(data) => Some(data.king.clone()),
            StateData::King(_) => Some(self.local.clone()),
            _ => None,
        }
    }

    pub fn prince(&self) -> Option<DeviceId> {
        match &self.state {
            StateData::Peasant(data) => data.prince.clone(),
            StateData::Prince(_) => Some(self.local.clone()),
            StateData::King(data) => data.prince.clone(),
            _ => None,
        }
    }

    fn note_transition(
        &self,
        from: StateKind,
        to: StateKind,
        reason: TransitionReason,
        effects: &mut Vec<KingdomEffect>,
    ) {
        debug_assert!(transition_allowed(from, to), "{from} -> {to} is not a legal move");
        tracing::debug!(local = %self.local, %from, %to, ?reason, "role change");
        effects.push(KingdomEffect::Emit(LifecycleEvent::StateChanged {
            from,
            to,
            reason,
        }));
    }

    // ── Commands ────────────────────────────────────────────────────

    pub fn handle_start(&mut self, _now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        if let StateData::Stopped = self.state {
            self.note_transition(
                StateKind::Stopped,
                StateKind::Free,
                TransitionReason::Started,
                &mut effects,
            );
            effects.push(KingdomEffect::SetChannelMode {
                mode: ChannelMode::Client { king: None },
            });
            self.state = StateData::Free(FreeData::default());
        }
        effects
    }

    pub fn handle_stop(&mut self, _now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        let from = self.state.kind();
        if from == StateKind::Stopped {
            return effects;
        }
        effects.push(KingdomEffect::DisconnectAll);
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Client { king: None },
        });
        if let Some(old_king) = self.king() {
            effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
                old: Some(old_king),
                new: None,
            }));
            effects.push(KingdomEffect::Emit(LifecycleEvent::Disconnected));
        }
        self.note_transition(from, StateKind::Stopped, TransitionReason::Stopped, &mut effects);
        self.state = StateData::Stopped;
        effects
    }

    // ── Discovery ───────────────────────────────────────────────────

    pub fn handle_discovery(
        &mut self,
        device: &DeviceId,
        state: DeviceState,
        now: u64,
    ) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        if *device == self.local {
            return effects;
        }
        match &mut self.state {
            StateData::Stopped => {}
            StateData::Free(data) => {
                if data.connecting_to.is_some() {
                    return effects;
                }
                let dial = match state {
                    DeviceState::King => true,
                    // Two Free devices: the one with the larger id
                    // dials; the smaller becomes King by accepting.
                    DeviceState::Free => *device < self.local,
                    _ => false,
                };
                if dial {
                    data.connecting_to = Some(device.clone());
                    data.join_reason = Some(TransitionReason::JoinedKingdom);
                    data.self_crown_at = None;
                    effects.push(KingdomEffect::Connect {
                        device: device.clone(),
                    });
                }
            }
            StateData::Peasant(data) => {
                // A Peasant never switches on its own; it reports the
                // sighting upstream so the King can run merge policy.
                if state == DeviceState::King && *device != data.king {
                    effects.push(KingdomEffect::SendAdmin {
                        to: data.king.clone(),
                        message: AdminMessage::DiscoveredDevice {
                            device_id: device.as_str().to_string(),
                            state,
                        },
                    });
                }
            }
            StateData::Prince(data) => {
                if state == DeviceState::King && *device != data.king {
                    if data.crowning_deadline.is_none() {
                        effects.push(KingdomEffect::SendAdmin {
                            to: data.king.clone(),
                            message: AdminMessage::PrinceFoundAKing {
                                king_id: device.as_str().to_string(),
                            },
                        });
                    } else {
                        // A live King mid-crowning is the contradicting
                        // signal: abandon the throne and join it.
                        return self.abandon_for_king(device.clone(), TransitionReason::BowedDown);
                    }
                }
            }
            StateData::King(_) => {
                if state == DeviceState::King {
                    return self.consider_rival_king(device.clone(), now);
                }
            }
        }
        effects
    }

    /// Merge policy between two Kings: the one with the smaller device
    /// id keeps the crown; the other bows down.
    fn consider_rival_king(&mut self, rival: DeviceId, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        let StateData::King(data) = &mut self.state else {
            return effects;
        };
        if data.bowing_down_to.is_some() || rival >= self.local {
            return effects;
        }
        tracing::info!(local = %self.local, winner = %rival, "losing kingdom merge, bowing down");
        data.bowing_down_to = Some((
            rival.clone(),
            now + ms(self.config.merge_bow_down_timeout),
        ));
        effects.push(KingdomEffect::BroadcastAdmin {
            message: AdminMessage::BowDownToNewKing {
                new_king_id: rival.as_str().to_string(),
            },
        });
        effects
    }

    /// Leave the current role and dial `king`, joining its kingdom.
    fn abandon_for_king(&mut self, king: DeviceId, reason: TransitionReason) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        let from = self.state.kind();
        if let Some(old_king) = self.king() {
            effects.push(KingdomEffect::Disconnect { device: old_king.clone() });
            effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
                old: Some(old_king),
                new: None,
            }));
            effects.push(KingdomEffect::Emit(LifecycleEvent::Disconnected));
        }
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Client { king: None },
        });
        effects.push(KingdomEffect::Connect {
            device: king.clone(),
        });
        self.note_transition(from, StateKind::Free, TransitionReason::KingConnectionLost, &mut effects);
        self.state = StateData::Free(FreeData {
            connecting_to: Some(king),
            join_reason: Some(reason),
            follow_heir: None,
            self_crown_at: None,
        });
        effects
    }

    // ── Connection events ───────────────────────────────────────────

    pub fn handle_connection_established(
        &mut self,
        device: &DeviceId,
        inbound: bool,
        now: u64,
    ) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        match &mut self.state {
            StateData::Stopped => {
                effects.push(KingdomEffect::Disconnect {
                    device: device.clone(),
                });
            }
            StateData::Free(data) => {
                if inbound {
                    return self.become_first_king(device.clone(), now);
                }
                if data.connecting_to.as_ref() == Some(device) {
                    let reason = data
                        .join_reason
                        .take()
                        .unwrap_or(TransitionReason::JoinedKingdom);
                    return self.become_peasant_of(device.clone(), reason);
                }
                // A connect we no longer want (e.g. the dial landed
                // after we gave up on it).
                effects.push(KingdomEffect::Disconnect {
                    device: device.clone(),
                });
            }
            StateData::Peasant(_) => {
                if inbound {
                    // We are nobody's King; force the peer back to
                    // discovery.
                    effects.push(KingdomEffect::Disconnect {
                        device: device.clone(),
                    });
                }
            }
            StateData::Prince(data) => {
                if inbound {
                    data.early_peasants.insert(device.clone());
                }
            }
            StateData::King(data) => {
                if inbound {
                    data.peasants.insert(device.clone());
                    data.lonely_since = None;
                    effects.push(KingdomEffect::Emit(LifecycleEvent::DeviceJoined {
                        device: device.clone(),
                    }));
                    if data.prince.is_none() && data.pending_pronounce.is_none() {
                        Self::pronounce(&self.config, data, device.clone(), now, &mut effects);
                    }
                    effects.push(Self::census_broadcast(&self.local, data));
                }
            }
        }
        effects
    }

    pub fn handle_connection_closed(&mut self, device: &DeviceId, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        match &mut self.state {
            StateData::Stopped | StateData::Free(_) => {}
            StateData::Peasant(data) => {
                if *device != data.king {
                    return effects;
                }
                let old_king = data.king.clone();
                let heir = data.prince.clone().filter(|p| *p != self.local);
                effects.push(KingdomEffect::SetChannelMode {
                    mode: ChannelMode::Client { king: None },
                });
                effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
                    old: Some(old_king),
                    new: None,
                }));
                effects.push(KingdomEffect::Emit(LifecycleEvent::Disconnected));
                self.note_transition(
                    StateKind::Peasant,
                    StateKind::Free,
                    TransitionReason::KingConnectionLost,
                    &mut effects,
                );
                self.state = StateData::Free(FreeData {
                    connecting_to: None,
                    join_reason: None,
                    follow_heir: heir
                        .map(|p| (p, now + ms(self.config.crowning_preparation_timeout))),
                    self_crown_at: None,
                });
            }
            StateData::Prince(data) => {
                if *device == data.king {
                    tracing::info!(local = %self.local, "king connection lost, preparing to crown");
                    data.crowning_deadline =
                        Some(now + ms(self.config.crowning_preparation_timeout));
                    effects.push(KingdomEffect::SetChannelMode {
                        mode: ChannelMode::Client { king: None },
                    });
                } else {
                    data.early_peasants.remove(device);
                }
            }
            StateData::King(data) => {
                if !data.peasants.remove(device) {
                    return effects;
                }
                effects.push(KingdomEffect::Emit(LifecycleEvent::DeviceLeft {
                    device: device.clone(),
                }));
                if data.prince.as_ref() == Some(device) {
                    let old = data.prince.take();
                    effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
                        old,
                        new: None,
                    }));
                }
                if data.pending_pronounce.as_ref().map(|(c, _)| c) == Some(device) {
                    data.pending_pronounce = None;
                }
                if data.prince.is_none() && data.pending_pronounce.is_none() {
                    if let Some(candidate) = data
                        .peasants
                        .iter()
                        .find(|p| !data.declined.contains(*p))
                        .cloned()
                    {
                        Self::pronounce(&self.config, data, candidate, now, &mut effects);
                    }
                }
                if data.peasants.is_empty() {
                    data.lonely_since = Some(now);
                }
                effects.push(Self::census_broadcast(&self.local, data));
            }
        }
        effects
    }

    pub fn handle_connect_failed(&mut self, device: &DeviceId, _now: u64) -> Vec<KingdomEffect> {
        if let StateData::Free(data) = &mut self.state {
            if data.connecting_to.as_ref() == Some(device) {
                tracing::debug!(local = %self.local, target = %device, "dial abandoned");
                data.connecting_to = None;
                data.join_reason = None;
                data.self_crown_at = None;
            }
        }
        Vec::new()
    }

    // ── Admin messages ──────────────────────────────────────────────

    pub fn handle_admin(
        &mut self,
        from: &DeviceId,
        message: &AdminMessage,
        now: u64,
    ) -> Vec<KingdomEffect> {
        match message {
            AdminMessage::Census { states } => self.handle_census(from, states),
            AdminMessage::PronouncePrince { prince_id } => self.handle_pronounce(from, prince_id),
            AdminMessage::AckPronouncePrince { prince_id } => self.handle_ack(from, prince_id),
            AdminMessage::BowDownToNewKing { new_king_id } => {
                self.handle_bow_down(from, new_king_id)
            }
            AdminMessage::PrinceFoundAKing { king_id } => {
                if matches!(self.state, StateData::King(_)) {
                    self.consider_rival_king(DeviceId::new(king_id), now)
                } else {
                    Vec::new()
                }
            }
            AdminMessage::DiscoveredDevice { device_id, state } => {
                self.handle_discovery(&DeviceId::new(device_id), *state, now)
            }
            // Relay plumbing and app-level text are not role concerns.
            _ => Vec::new(),
        }
    }

    fn handle_census(
        &mut self,
        from: &DeviceId,
        states: &BTreeMap<String, DeviceState>,
    ) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        if *from == self.local {
            return effects;
        }
        let (census, prince_slot, king) = match &mut self.state {
            StateData::Peasant(data) => (&mut data.census, Some(&mut data.prince), &data.king),
            StateData::Prince(data) => (&mut data.census, None, &data.king),
            _ => return effects,
        };
        if from != king {
            return effects;
        }
        let local_id = self.local.as_str();
        for device_id in states.keys() {
            if device_id != local_id && !census.contains_key(device_id) {
                effects.push(KingdomEffect::Emit(LifecycleEvent::DeviceJoined {
                    device: DeviceId::new(device_id),
                }));
            }
        }
        for device_id in census.keys() {
            if device_id != local_id && !states.contains_key(device_id) {
                effects.push(KingdomEffect::Emit(LifecycleEvent::DeviceLeft {
                    device: DeviceId::new(device_id),
                }));
            }
        }
        if let Some(prince_slot) = prince_slot {
            let announced = states
                .iter()
                .find(|(_, s)| **s == DeviceState::Prince)
                .map(|(id, _)| DeviceId::new(id));
            if *prince_slot != announced {
                effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
                    old: prince_slot.clone(),
                    new: announced.clone(),
                }));
                *prince_slot = announced;
            }
        }
        *census = states.clone();
        effects
    }

    fn handle_pronounce(&mut self, from: &DeviceId, prince_id: &str) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        match &mut self.state {
            StateData::Peasant(data) => {
                if from != &data.king {
                    return effects;
                }
                if prince_id == self.local.as_str() {
                    effects.push(KingdomEffect::SendAdmin {
                        to: data.king.clone(),
                        message: AdminMessage::AckPronouncePrince {
                            prince_id: prince_id.to_string(),
                        },
                    });
                    effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
                        old: data.prince.clone(),
                        new: Some(self.local.clone()),
                    }));
                    let king = data.king.clone();
                    let census = std::mem::take(&mut data.census);
                    self.note_transition(
                        StateKind::Peasant,
                        StateKind::Prince,
                        TransitionReason::Pronounced,
                        &mut effects,
                    );
                    self.state = StateData::Prince(PrinceData {
                        king,
                        crowning_deadline: None,
                        early_peasants: BTreeSet::new(),
                        census,
                    });
                } else {
                    data.prince = Some(DeviceId::new(prince_id));
                }
            }
            StateData::Prince(data) => {
                if from != &data.king {
                    return effects;
                }
                if prince_id == self.local.as_str() {
                    // The King asked again; ack again.
                    effects.push(KingdomEffect::SendAdmin {
                        to: data.king.clone(),
                        message: AdminMessage::AckPronouncePrince {
                            prince_id: prince_id.to_string(),
                        },
                    });
                } else {
                    let king = data.king.clone();
                    let census = std::mem::take(&mut data.census);
                    effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
                        old: Some(self.local.clone()),
                        new: Some(DeviceId::new(prince_id)),
                    }));
                    self.note_transition(
                        StateKind::Prince,
                        StateKind::Peasant,
                        TransitionReason::Demoted,
                        &mut effects,
                    );
                    self.state = StateData::Peasant(PeasantData {
                        king,
                        prince: Some(DeviceId::new(prince_id)),
                        census,
                    });
                }
            }
            _ => {}
        }
        effects
    }

    fn handle_ack(&mut self, from: &DeviceId, prince_id: &str) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        if let StateData::King(data) = &mut self.state {
            let expected = data
                .pending_pronounce
                .as_ref()
                .is_some_and(|(c, _)| c == from && c.as_str() == prince_id);
            if expected {
                data.pending_pronounce = None;
                data.declined.clear();
                let old = data.prince.replace(from.clone());
                effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
                    old,
                    new: Some(from.clone()),
                }));
                effects.push(Self::census_broadcast(&self.local, data));
            }
        }
        effects
    }

    fn handle_bow_down(&mut self, from: &DeviceId, new_king_id: &str) -> Vec<KingdomEffect> {
        let new_king = DeviceId::new(new_king_id);
        match &self.state {
            StateData::Peasant(data) if *from == data.king => {
                self.abandon_for_king(new_king, TransitionReason::BowedDown)
            }
            StateData::Prince(data) if *from == data.king => {
                self.abandon_for_king(new_king, TransitionReason::BowedDown)
            }
            StateData::Free(data) if data.connecting_to.is_none() => {
                let mut effects = Vec::new();
                if let StateData::Free(data) = &mut self.state {
                    data.connecting_to = Some(new_king.clone());
                    data.join_reason = Some(TransitionReason::BowedDown);
                    data.follow_heir = None;
                }
                effects.push(KingdomEffect::Connect { device: new_king });
                effects
            }
            // Kings ignore it: the loser's own loopback arrives here.
            _ => Vec::new(),
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub fn tick(&mut self, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        match &mut self.state {
            StateData::Stopped => {}
            StateData::Free(data) => {
                if let Some((heir, at)) = data.follow_heir.clone() {
                    if now >= at && data.connecting_to.is_none() {
                        data.follow_heir = None;
                        data.connecting_to = Some(heir.clone());
                        data.join_reason = Some(TransitionReason::FollowedTheHeirToTheThrone);
                        effects.push(KingdomEffect::Connect { device: heir });
                    }
                } else if data.connecting_to.is_none() {
                    // Nothing to join and nothing in flight: arm the
                    // lone-crowning timer, and fire it once expired.
                    match data.self_crown_at {
                        None => {
                            data.self_crown_at =
                                Some(now + ms(self.config.crowning_preparation_timeout));
                        }
                        Some(at) if now >= at => return self.become_lone_king(now),
                        Some(_) => {}
                    }
                }
            }
            StateData::Peasant(_) => {}
            StateData::Prince(data) => {
                if data.crowning_deadline.is_some_and(|at| now >= at) {
                    return self.crown_self(now);
                }
            }
            StateData::King(data) => {
                if let Some((winner, at)) = data.bowing_down_to.clone() {
                    if now >= at {
                        return self.finish_bow_down(winner);
                    }
                }
                if data
                    .lonely_since
                    .is_some_and(|since| {
                        now >= since + ms(self.config.king_without_peasants_timeout)
                    })
                {
                    return self.step_down();
                }
                if let Some((candidate, at)) = data.pending_pronounce.clone() {
                    if now >= at {
                        tracing::debug!(local = %self.local, candidate = %candidate,
                            "prince candidate never acked");
                        data.pending_pronounce = None;
                        data.declined.insert(candidate.clone());
                        let next = data
                            .peasants
                            .iter()
                            .find(|p| !data.declined.contains(*p))
                            .cloned();
                        match next {
                            Some(next) => {
                                Self::pronounce(&self.config, data, next, now, &mut effects)
                            }
                            // Everyone declined; start over next join.
                            None => data.declined.clear(),
                        }
                    }
                }
                if now >= data.next_census_at {
                    data.next_census_at = now + ms(self.config.keep_alive_interval);
                    effects.push(Self::census_broadcast(&self.local, data));
                }
            }
        }
        effects
    }

    // ── Role changes ────────────────────────────────────────────────

    fn become_peasant_of(&mut self, king: DeviceId, reason: TransitionReason) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Client {
                king: Some(king.clone()),
            },
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: None,
            new: Some(king.clone()),
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::Connected {
            king: king.clone(),
        }));
        self.note_transition(StateKind::Free, StateKind::Peasant, reason, &mut effects);
        self.state = StateData::Peasant(PeasantData {
            king,
            prince: None,
            census: BTreeMap::new(),
        });
        effects
    }

    fn become_first_king(&mut self, first_peasant: DeviceId, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        let mut data = KingData {
            next_census_at: now + ms(self.config.keep_alive_interval),
            ..KingData::default()
        };
        data.peasants.insert(first_peasant.clone());
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Master,
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: None,
            new: Some(self.local.clone()),
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::Connected {
            king: self.local.clone(),
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::DeviceJoined {
            device: first_peasant.clone(),
        }));
        Self::pronounce(&self.config, &mut data, first_peasant, now, &mut effects);
        effects.push(Self::census_broadcast(&self.local, &data));
        self.note_transition(
            StateKind::Free,
            StateKind::King,
            TransitionReason::AcceptedFirstPeasant,
            &mut effects,
        );
        self.state = StateData::King(data);
        effects
    }

    fn become_lone_king(&mut self, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        tracing::info!(local = %self.local, "no kingdom in sight, founding one");
        let data = KingData {
            lonely_since: Some(now),
            next_census_at: now + ms(self.config.keep_alive_interval),
            ..KingData::default()
        };
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Master,
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: None,
            new: Some(self.local.clone()),
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::Connected {
            king: self.local.clone(),
        }));
        self.note_transition(
            StateKind::Free,
            StateKind::King,
            TransitionReason::FoundedKingdom,
            &mut effects,
        );
        self.state = StateData::King(data);
        effects
    }

    fn crown_self(&mut self, now: u64) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        let StateData::Prince(prince) = &mut self.state else {
            return effects;
        };
        tracing::info!(local = %self.local, "crowning self as king");
        let old_king = prince.king.clone();
        let mut data = KingData {
            peasants: std::mem::take(&mut prince.early_peasants),
            next_census_at: now + ms(self.config.keep_alive_interval),
            ..KingData::default()
        };
        if data.peasants.is_empty() {
            data.lonely_since = Some(now);
        }
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Master,
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: Some(old_king),
            new: Some(self.local.clone()),
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::PrinceChanged {
            old: Some(self.local.clone()),
            new: None,
        }));
        if let Some(candidate) = data.peasants.iter().next().cloned() {
            Self::pronounce(&self.config, &mut data, candidate, now, &mut effects);
        }
        effects.push(Self::census_broadcast(&self.local, &data));
        self.note_transition(
            StateKind::Prince,
            StateKind::King,
            TransitionReason::Crowned,
            &mut effects,
        );
        self.state = StateData::King(data);
        effects
    }

    fn finish_bow_down(&mut self, winner: DeviceId) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        effects.push(KingdomEffect::DisconnectAll);
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Client { king: None },
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: Some(self.local.clone()),
            new: None,
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::Disconnected));
        effects.push(KingdomEffect::Connect {
            device: winner.clone(),
        });
        self.note_transition(
            StateKind::King,
            StateKind::Free,
            TransitionReason::BowedDown,
            &mut effects,
        );
        self.state = StateData::Free(FreeData {
            connecting_to: Some(winner),
            join_reason: Some(TransitionReason::BowedDown),
            follow_heir: None,
            self_crown_at: None,
        });
        effects
    }

    fn step_down(&mut self) -> Vec<KingdomEffect> {
        let mut effects = Vec::new();
        tracing::info!(local = %self.local, "no peasants left, stepping down");
        effects.push(KingdomEffect::SetChannelMode {
            mode: ChannelMode::Client { king: None },
        });
        effects.push(KingdomEffect::Emit(LifecycleEvent::KingChanged {
            old: Some(self.local.clone()),
            new: None,
        }));
        effects.push(KingdomEffect::Emit(LifecycleEvent::Disconnected));
        self.note_transition(
            StateKind::King,
            StateKind::Free,
            TransitionReason::SteppedDown,
            &mut effects,
        );
        self.state = StateData::Free(FreeData::default());
        effects
    }

    // ── King helpers ────────────────────────────────────────────────

    fn pronounce(
        config: &CrownConfig,
        data: &mut KingData,
        candidate: DeviceId,
        now: u64,
        effects: &mut Vec<KingdomEffect>,
    ) {
        data.pending_pronounce =
            Some((candidate.clone(), now + ms(config.prince_ack_timeout)));
        effects.push(KingdomEffect::SendAdmin {
            to: candidate.clone(),
            message: AdminMessage::PronouncePrince {
                prince_id: candidate.as_str().to_string(),
            },
        });
    }

    fn census_broadcast(local: &DeviceId, data: &KingData) -> KingdomEffect {
        let mut states = BTreeMap::new();
        states.insert(local.as_str().to_string(), DeviceState::King);
        for peasant in &data.peasants {
            let state = if data.prince.as_ref() == Some(peasant) {
                DeviceState::Prince
            } else {
                DeviceState::Peasant
            };
            states.insert(peasant.as_str().to_string(), state);
        }
        KingdomEffect::BroadcastAdmin {
            message: AdminMessage::Census { states },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
