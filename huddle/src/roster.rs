use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{signaling::ParticipantInfo, PeerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: String,
    /// informational only, as announced by the participant
    #[serde(default)]
    pub muted: bool,
}

impl From<ParticipantInfo> for Participant {
    fn from(value: ParticipantInfo) -> Self {
        Self {
            peer_id: value.id,
            display_name: value.username,
            muted: false,
        }
    }
}

/// The set of participants currently considered part of the call, keyed by peer id.
/// Every update is idempotent: adding twice is the same as adding once, removing an absent
/// peer does nothing. Insertion order is kept so the dock shows avatars in join order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Roster {
    participants: IndexMap<PeerId, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// set-union with a single entry. returns true if the peer was not yet present.
    /// the display name of an existing entry is kept.
    pub fn add(&mut self, peer_id: &PeerId, display_name: &str) -> bool {
        if self.participants.contains_key(peer_id) {
            return false;
        }
        self.participants.insert(
            peer_id.clone(),
            Participant {
                peer_id: peer_id.clone(),
                display_name: display_name.to_string(),
                muted: false,
            },
        );
        true
    }

    /// returns the removed entry, if the peer was present
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Participant> {
        self.participants.shift_remove(peer_id)
    }

    pub fn set_muted(&mut self, peer_id: &PeerId, muted: bool) -> bool {
        match self.participants.get_mut(peer_id) {
            Some(participant) if participant.muted != muted => {
                participant.muted = muted;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.participants.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Participant> {
        self.participants.get(peer_id)
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.participants.keys()
    }

    /// every participant except `own_id`
    pub fn others(&self, own_id: &PeerId) -> Vec<PeerId> {
        self.participants
            .keys()
            .filter(|id| *id != own_id)
            .cloned()
            .collect()
    }

    pub fn to_vec(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }
}
