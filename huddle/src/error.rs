use thiserror::Error;

use crate::PeerId;

/// Errors produced by the call subsystem. None of them is fatal to the process:
/// the worst case is a call with one peer missing, or no voice at all.
#[derive(Error, Debug)]
pub enum Error {
    //Media Errors
    #[error("Microphone unavailable: {_0}")]
    MediaUnavailable(String),
    #[error("Negotiation with peer {peer_id} failed: {reason}")]
    NegotiationFailure { peer_id: PeerId, reason: String },
    #[error("Stale message: {_0}")]
    StaleMessage(String),

    //Call Errors
    #[error("CallNotInProgress")]
    CallNotInProgress,
    #[error("CallAlreadyInProgress")]
    CallAlreadyInProgress,
    #[error("There is no call to join")]
    NotRinging,
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),
    #[error("Call controller is no longer running")]
    ControllerStopped,

    //Config Errors
    #[error("Invalid configuration: {_0}")]
    InvalidConfig(String),

    //Misc
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("{0}")]
    TomlError(#[from] toml::de::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl Error {
    pub fn negotiation(peer_id: &PeerId, reason: impl ToString) -> Self {
        Error::NegotiationFailure {
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// true if the error means the link to one peer has to be abandoned.
    /// stale messages and local-only errors leave every link untouched.
    pub fn is_fatal_to_peer(&self) -> bool {
        matches!(self, Error::NegotiationFailure { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
