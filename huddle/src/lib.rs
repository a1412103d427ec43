//! Ad-hoc voice calls for participants who already share a room.
//!
//! Every client keeps its own replica of the call (who is calling, who is ringing, who is
//! connected) and reconciles it with the named events a relay fans out to the room. Media flows
//! over a mesh: each pair of in-call participants gets one direct connection.
//!
//! [`controller::CallController`] owns the pieces and runs them on one task:
//! - [`session::CallSession`] is the call lifecycle and roster state machine
//! - [`peers::PeerManager`] owns one link per remote participant and the shared microphone
//! - [`ui::CallUi`] turns state into controls and issues one signal per gesture
//!
//! The media stack is abstracted behind [`media::MediaBackend`]. [`loopback::LoopbackBackend`]
//! is an in-process implementation; the `huddle-wrtc` extension provides a webrtc-rs one.

pub mod config;
pub mod controller;
pub mod error;
pub mod loopback;
pub mod media;
pub mod peers;
pub mod relay;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod ui;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use controller::{CallController, CallEvent, CallEventStream, CallSnapshot};
pub use error::{Error, Result};
pub use session::CallState;

/// identifies one connected client for the lifetime of its relay connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// identifies the room a call belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(PeerId);
string_id!(RoomId);
