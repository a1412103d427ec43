//! What the call dock shows, and the gestures it offers.
//!
//! [`CallView`] is computed from a [`CallSnapshot`] alone, so rendering never races the call
//! task. [`CallUi`] maps each gesture to exactly one controller command.

use serde::Serialize;

use crate::{
    controller::{CallController, CallSnapshot},
    error::Result,
    session::CallState,
    PeerId,
};

/// `m:ss`
pub fn format_elapsed(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// the first two characters of a display name, upper-cased
pub fn initials(display_name: &str) -> String {
    display_name.chars().take(2).collect::<String>().to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallButton {
    pub label: &'static str,
    pub enabled: bool,
}

impl CallButton {
    pub fn for_state(state: CallState) -> Self {
        match state {
            CallState::Idle | CallState::Ended => Self {
                label: "Call",
                enabled: true,
            },
            CallState::Calling => Self {
                label: "Calling…",
                enabled: false,
            },
            CallState::Ringing => Self {
                label: "Join call",
                enabled: true,
            },
            CallState::InCall => Self {
                label: "In call",
                enabled: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub headline: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Avatar {
    pub peer_id: PeerId,
    pub initials: String,
    pub display_name: String,
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Control {
    Join,
    Cancel,
    Mute,
    Unmute,
    /// leave, shown to a host who is alone in the call
    EndCall,
    Leave,
}

impl Control {
    pub fn label(&self) -> &'static str {
        match self {
            Control::Join => "Join",
            Control::Cancel => "Cancel",
            Control::Mute => "Mute",
            Control::Unmute => "Unmute",
            Control::EndCall => "End call",
            Control::Leave => "Leave",
        }
    }
}

/// the call dock. absent while Idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dock {
    pub banner: Banner,
    /// in roster order
    pub avatars: Vec<Avatar>,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallView {
    pub button: CallButton,
    pub dock: Option<Dock>,
}

impl CallView {
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Self {
        let button = CallButton::for_state(snapshot.state);
        if snapshot.state == CallState::Idle {
            return Self { button, dock: None };
        }

        let host = snapshot.host_label.as_deref();
        let banner = match snapshot.state {
            CallState::Calling => Banner {
                headline: "Calling everyone in this room…".into(),
                detail: host.map(|h| format!("Host: {h}")),
            },
            CallState::Ringing => Banner {
                headline: format!("{} is in a call…", host.unwrap_or("Someone")),
                detail: Some("Tap Join to enter the call.".into()),
            },
            CallState::InCall => Banner {
                headline: format!("In call — {}", format_elapsed(snapshot.elapsed_secs)),
                detail: snapshot.room_id.as_ref().map(|r| format!("Room {r}")),
            },
            CallState::Ended | CallState::Idle => Banner {
                headline: "Call ended".into(),
                detail: None,
            },
        };

        let avatars = snapshot
            .participants
            .iter()
            .map(|p| Avatar {
                peer_id: p.peer_id.clone(),
                initials: initials(&p.display_name),
                display_name: p.display_name.clone(),
                muted: p.muted,
            })
            .collect();

        let controls = match snapshot.state {
            CallState::Ringing => vec![Control::Join],
            CallState::Calling => vec![Control::Cancel],
            CallState::InCall => {
                let is_host = host == Some(snapshot.own_name.as_str());
                let host_alone = is_host && snapshot.others().next().is_none();
                vec![
                    if snapshot.is_muted {
                        Control::Unmute
                    } else {
                        Control::Mute
                    },
                    if host_alone {
                        Control::EndCall
                    } else {
                        Control::Leave
                    },
                ]
            }
            CallState::Ended | CallState::Idle => vec![],
        };

        Self {
            button,
            dock: Some(Dock {
                banner,
                avatars,
                controls,
            }),
        }
    }
}

/// issues the local user's gestures
#[derive(Clone)]
pub struct CallUi {
    controller: CallController,
}

impl CallUi {
    pub fn new(controller: CallController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &CallController {
        &self.controller
    }

    pub async fn view(&self) -> Result<CallView> {
        let snapshot = self.controller.snapshot().await?;
        Ok(CallView::from_snapshot(&snapshot))
    }

    /// starts a call, or joins the one the room is ringing with. does nothing while disabled
    pub async fn press_call_button(&self) -> Result<()> {
        match self.controller.snapshot().await?.state {
            CallState::Idle | CallState::Ended => self.controller.start_call().await,
            CallState::Ringing => self.controller.accept_call().await,
            CallState::Calling | CallState::InCall => Ok(()),
        }
    }

    pub async fn press(&self, control: Control) -> Result<()> {
        match control {
            Control::Join => self.controller.accept_call().await,
            Control::Cancel | Control::EndCall | Control::Leave => {
                self.controller.leave_call().await
            }
            Control::Mute => self.controller.set_muted(true).await,
            Control::Unmute => self.controller.set_muted(false).await,
        }
    }

    pub async fn toggle_mute(&self) -> Result<()> {
        let muted = self.controller.snapshot().await?.is_muted;
        self.controller.set_muted(!muted).await
    }
}
