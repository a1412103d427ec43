//! The call lifecycle as seen by one client.
//!
//! `CallSession` is a plain state machine: local gestures and relay events go in, a list of
//! [`Effect`]s comes out. It never touches media or the network itself; the owner (the call
//! controller task) carries the effects out, in order. Timers are owned by the controller as
//! well and keyed off state transitions.
//!
//! ```text
//!  Idle ──start──▶ Calling ──someone joined──▶ InCall ──own leave acked──▶ Ringing
//!   │                 │ cancel                   ▲                          │
//!   │                 ▼                          │          accept          │
//!   │               Idle                         └──────────────────────────┘
//!   └──incoming-call / call-existing──▶ Ringing
//!  any ──call-ended / room empty──▶ Ended ──linger──▶ Idle
//! ```

use std::collections::HashSet;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    roster::{Participant, Roster},
    signaling::{ClientSignal, ParticipantInfo, RelaySignal},
    PeerId, RoomId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum CallState {
    /// no call in this room
    #[default]
    #[display(fmt = "Idle")]
    Idle,
    /// the local user started a call and nobody joined yet
    #[display(fmt = "Calling")]
    Calling,
    /// a call is running in the room and the local user can join it
    #[display(fmt = "Ringing")]
    Ringing,
    #[display(fmt = "InCall")]
    InCall,
    /// transient, reverts to Idle once the linger timer fires
    #[display(fmt = "Ended")]
    Ended,
}

/// what the owner of a [`CallSession`] has to carry out after an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(ClientSignal),
    /// the local user just joined. open links toward these peers and send offers
    OfferTo(Vec<PeerId>),
    CloseLink(PeerId),
    /// close every link and release the microphone
    CloseAll,
    SetLocalMute(bool),
    ParticipantJoined(Participant),
    ParticipantLeft(PeerId),
    ParticipantMuted { peer_id: PeerId, muted: bool },
    Declined { username: String },
}

#[derive(Debug, Clone)]
pub struct CallSession {
    own_id: PeerId,
    own_name: String,
    /// the room this client has entered. relay events for other rooms are stale
    room: RoomId,
    state: CallState,
    call_room: Option<RoomId>,
    host_label: Option<String>,
    is_muted: bool,
    roster: Roster,
    /// the local user asked to leave and the relay has not acknowledged it yet
    leave_pending: bool,
    /// peers that left during this call and have not been listed again since
    departed: HashSet<PeerId>,
}

impl CallSession {
    pub fn new(own_id: PeerId, own_name: impl Into<String>, room: RoomId) -> Self {
        Self {
            own_id,
            own_name: own_name.into(),
            room,
            state: CallState::Idle,
            call_room: None,
            host_label: None,
            is_muted: false,
            roster: Roster::new(),
            leave_pending: false,
            departed: HashSet::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    pub fn own_name(&self) -> &str {
        &self.own_name
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// the room of the current call. None iff Idle
    pub fn room_id(&self) -> Option<&RoomId> {
        self.call_room.as_ref()
    }

    pub fn host_label(&self) -> Option<&str> {
        self.host_label.as_deref()
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn leave_pending(&self) -> bool {
        self.leave_pending
    }

    /// offers, answers and candidates are only applied while this is true.
    /// a host still in Calling accepts them too: a joiner's offer may overtake
    /// the `call-user-joined` that moves the host to InCall.
    pub fn accepts_media(&self) -> bool {
        matches!(self.state, CallState::Calling | CallState::InCall) && !self.leave_pending
    }

    /// an offer, answer or candidate from `from` may be applied only if this is Ok.
    /// a peer that left can't open a link again until the relay lists it anew.
    pub fn check_peer_signal(&self, from: &PeerId) -> Result<()> {
        if !self.accepts_media() {
            return Err(Error::StaleMessage(format!(
                "signal from {from} while not in a call"
            )));
        }
        if self.departed.contains(from) {
            return Err(Error::StaleMessage(format!(
                "signal from {from} after it left the call"
            )));
        }
        Ok(())
    }

    // ------ local gestures ------

    pub fn start_call(&mut self) -> Result<Vec<Effect>> {
        match self.state {
            CallState::Idle | CallState::Ended => {
                self.reset();
                self.state = CallState::Calling;
                self.call_room = Some(self.room.clone());
                self.host_label = Some(self.own_name.clone());
                Ok(vec![Effect::Send(ClientSignal::CallStart {
                    room_id: self.room.clone(),
                    username: self.own_name.clone(),
                    peer_id: self.own_id.clone(),
                })])
            }
            CallState::Calling | CallState::Ringing | CallState::InCall => {
                Err(Error::CallAlreadyInProgress)
            }
        }
    }

    pub fn accept_call(&mut self) -> Result<Vec<Effect>> {
        match self.state {
            CallState::Ringing => {
                let mut effects = vec![];
                self.enter_in_call(&mut effects);
                effects.push(Effect::Send(ClientSignal::CallAccept {
                    room_id: self.room.clone(),
                    username: self.own_name.clone(),
                    peer_id: self.own_id.clone(),
                }));
                self.offer_to_others(&mut effects);
                Ok(effects)
            }
            CallState::Calling | CallState::InCall => Err(Error::CallAlreadyInProgress),
            CallState::Idle | CallState::Ended => Err(Error::NotRinging),
        }
    }

    pub fn leave_call(&mut self) -> Result<Vec<Effect>> {
        match self.state {
            CallState::Calling => {
                // cancelled before anyone joined: nothing to wait for
                let effects = vec![
                    Effect::Send(ClientSignal::CallLeave {
                        room_id: self.room.clone(),
                    }),
                    Effect::CloseAll,
                ];
                self.reset();
                Ok(effects)
            }
            CallState::InCall if self.leave_pending => Ok(vec![]),
            CallState::InCall => {
                self.leave_pending = true;
                Ok(vec![
                    Effect::Send(ClientSignal::CallLeave {
                        room_id: self.room.clone(),
                    }),
                    Effect::CloseAll,
                ])
            }
            CallState::Idle | CallState::Ringing | CallState::Ended => {
                Err(Error::CallNotInProgress)
            }
        }
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<Vec<Effect>> {
        if self.state != CallState::InCall || self.leave_pending {
            return Err(Error::CallNotInProgress);
        }
        if self.is_muted == muted {
            return Ok(vec![]);
        }
        self.is_muted = muted;
        let own_id = self.own_id.clone();
        self.roster.set_muted(&own_id, muted);
        Ok(vec![
            Effect::SetLocalMute(muted),
            Effect::Send(ClientSignal::CallMute {
                room_id: self.room.clone(),
                muted,
            }),
        ])
    }

    /// the Ended linger expired. returns true if the session reverted to Idle
    pub fn finish_linger(&mut self) -> bool {
        if self.state == CallState::Ended {
            self.reset();
            true
        } else {
            false
        }
    }

    // ------ relay events ------

    pub fn handle_relay(&mut self, signal: &RelaySignal) -> Result<Vec<Effect>> {
        if let Some(room_id) = signal.room_id() {
            if room_id != &self.room {
                return Err(Error::StaleMessage(format!("{signal} for room {room_id}")));
            }
        }

        let mut effects = vec![];
        match signal {
            RelaySignal::IncomingCall {
                caller,
                caller_id,
                participants,
                ..
            } => {
                if self.state == CallState::InCall {
                    self.host_label = Some(caller.clone());
                    self.merge(participants, &mut effects);
                    return Ok(effects);
                }
                // the echo of a call this client already cancelled
                if caller_id == &self.own_id && self.state != CallState::Calling {
                    return Err(Error::StaleMessage(format!("{signal} in state {}", self.state)));
                }
                if self.state == CallState::Ended {
                    self.reset();
                }
                self.call_room = Some(self.room.clone());
                self.host_label = Some(caller.clone());
                self.state = if caller_id == &self.own_id {
                    CallState::Calling
                } else {
                    CallState::Ringing
                };
                self.merge(participants, &mut effects);
            }
            RelaySignal::CallExisting {
                host_name,
                participants,
                ..
            } => {
                if self.state == CallState::InCall {
                    if host_name.is_some() {
                        self.host_label = host_name.clone();
                    }
                    self.merge(participants, &mut effects);
                    return Ok(effects);
                }
                if self.state == CallState::Ended {
                    self.reset();
                }
                self.call_room = Some(self.room.clone());
                self.host_label = host_name.clone();
                if participants.iter().any(|p| p.id == self.own_id) {
                    self.enter_in_call(&mut effects);
                    self.merge(participants, &mut effects);
                    self.offer_to_others(&mut effects);
                } else {
                    self.state = CallState::Ringing;
                    self.merge(participants, &mut effects);
                }
            }
            RelaySignal::CallUserJoined {
                peer_id,
                username,
                participants,
            } => {
                if self.state == CallState::Ended {
                    return Err(Error::StaleMessage(format!("{signal} after call ended")));
                }
                let self_joined = peer_id == &self.own_id;
                let self_listed = participants.iter().any(|p| p.id == self.own_id);
                let was = self.state;

                if self_joined || self_listed || matches!(was, CallState::Calling | CallState::InCall)
                {
                    if self.leave_pending && !self_joined {
                        // still in InCall until the relay acknowledges the leave
                        self.add(peer_id, username, &mut effects);
                        self.merge(participants, &mut effects);
                        return Ok(effects);
                    }
                    if was != CallState::InCall {
                        self.enter_in_call(&mut effects);
                    }
                    self.add(peer_id, username, &mut effects);
                    self.merge(participants, &mut effects);
                    // joiner initiates. the host moving out of Calling waits for offers
                    let joined_now = matches!(was, CallState::Idle | CallState::Ringing);
                    if self_joined || joined_now {
                        self.offer_to_others(&mut effects);
                    }
                } else {
                    if was == CallState::Idle {
                        log::debug!("learned of a running call from {signal}");
                        self.call_room = Some(self.room.clone());
                        self.state = CallState::Ringing;
                    }
                    self.add(peer_id, username, &mut effects);
                    self.merge(participants, &mut effects);
                }
            }
            RelaySignal::CallUserLeft {
                peer_id,
                room_empty,
                ..
            } => {
                if matches!(self.state, CallState::Idle | CallState::Ended) {
                    return Err(Error::StaleMessage(format!("{signal} without a call")));
                }
                if self.roster.remove(peer_id).is_some() {
                    effects.push(Effect::ParticipantLeft(peer_id.clone()));
                }
                if *room_empty {
                    self.end_call(&mut effects);
                    return Ok(effects);
                }
                if peer_id == &self.own_id {
                    self.leave_pending = false;
                    self.is_muted = false;
                    effects.push(Effect::CloseAll);
                    if self.state == CallState::InCall {
                        self.state = CallState::Ringing;
                    }
                } else {
                    self.departed.insert(peer_id.clone());
                    effects.push(Effect::CloseLink(peer_id.clone()));
                }
            }
            RelaySignal::CallEnded {} => {
                if matches!(self.state, CallState::Idle | CallState::Ended) {
                    return Err(Error::StaleMessage(format!("{signal} without a call")));
                }
                self.end_call(&mut effects);
            }
            RelaySignal::CallUserMuted { peer_id, muted } => {
                if self.roster.set_muted(peer_id, *muted) {
                    effects.push(Effect::ParticipantMuted {
                        peer_id: peer_id.clone(),
                        muted: *muted,
                    });
                }
            }
            RelaySignal::CallUserDeclined { username } => {
                log::info!("{username} declined the call");
                effects.push(Effect::Declined {
                    username: username.clone(),
                });
            }
            RelaySignal::CallOffer { .. }
            | RelaySignal::CallAnswer { .. }
            | RelaySignal::CallIceCandidate { .. } => {
                log::warn!("{signal} routed to the call session; ignoring");
            }
        }
        Ok(effects)
    }

    // ------ helpers ------

    fn enter_in_call(&mut self, effects: &mut Vec<Effect>) {
        self.state = CallState::InCall;
        self.leave_pending = false;
        if self.call_room.is_none() {
            self.call_room = Some(self.room.clone());
        }
        let own_id = self.own_id.clone();
        let own_name = self.own_name.clone();
        self.add(&own_id, &own_name, effects);
    }

    fn end_call(&mut self, effects: &mut Vec<Effect>) {
        self.state = CallState::Ended;
        self.leave_pending = false;
        self.is_muted = false;
        effects.extend(self.roster.peer_ids().cloned().map(Effect::ParticipantLeft));
        self.roster.clear();
        self.departed.clear();
        effects.push(Effect::CloseAll);
    }

    fn reset(&mut self) {
        self.state = CallState::Idle;
        self.call_room = None;
        self.host_label = None;
        self.is_muted = false;
        self.leave_pending = false;
        self.roster.clear();
        self.departed.clear();
    }

    fn offer_to_others(&self, effects: &mut Vec<Effect>) {
        if !self.accepts_media() {
            return;
        }
        let others = self.roster.others(&self.own_id);
        if !others.is_empty() {
            effects.push(Effect::OfferTo(others));
        }
    }

    fn add(&mut self, peer_id: &PeerId, name: &str, effects: &mut Vec<Effect>) {
        self.departed.remove(peer_id);
        // the local user is listed only while InCall
        if peer_id == &self.own_id && self.state != CallState::InCall {
            return;
        }
        if self.roster.add(peer_id, name) {
            if let Some(p) = self.roster.get(peer_id) {
                effects.push(Effect::ParticipantJoined(p.clone()));
            }
        }
    }

    fn merge(&mut self, participants: &[ParticipantInfo], effects: &mut Vec<Effect>) {
        for p in participants {
            self.add(&p.id, &p.username, effects);
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(
            self.call_room.is_some(),
            self.state != CallState::Idle,
            "room set iff not idle ({:?})",
            self.state
        );
        if matches!(self.state, CallState::Idle | CallState::Ended) {
            assert!(self.departed.is_empty());
            assert!(!self.is_muted);
        }
        assert!(self.departed.iter().all(|p| !self.roster.contains(p)));
        if self.state == CallState::Idle {
            assert!(self.roster.is_empty());
            assert!(self.host_label.is_none());
        }
        assert_eq!(
            self.roster.contains(&self.own_id),
            self.state == CallState::InCall,
            "self listed iff in call ({:?})",
            self.state
        );
    }
}
