//! The seam between call logic and a media stack.
//!
//! A [`MediaBackend`] hands out a microphone capture and point-to-point connections. Every
//! connection reports what happens on it (local route candidates, remote audio, state changes)
//! through the [`LinkObserver`] it was created with; the peer manager drains those events on the
//! controller task.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    error::Result,
    signaling::{IceCandidate, SessionDescription},
    PeerId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ConnectionState {
    #[display(fmt = "new")]
    New,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "closed")]
    Closed,
}

/// describes remote audio arriving on a link. playback itself is the backend's business
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub stream_id: String,
}

/// tells apart successive connections to the same peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(fmt = "#{}", _0)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Display)]
pub enum LinkEvent {
    /// a local route candidate that must reach `peer`
    #[display(fmt = "Ice")]
    Ice {
        peer: PeerId,
        link: LinkId,
        candidate: IceCandidate,
    },
    #[display(fmt = "StateChanged({})", state)]
    StateChanged {
        peer: PeerId,
        link: LinkId,
        state: ConnectionState,
    },
    #[display(fmt = "TrackAdded")]
    TrackAdded { link: LinkId, stream: RemoteStream },
}

impl LinkEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            LinkEvent::Ice { peer, .. } | LinkEvent::StateChanged { peer, .. } => peer,
            LinkEvent::TrackAdded { stream, .. } => &stream.peer_id,
        }
    }

    /// the connection that raised the event
    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::Ice { link, .. }
            | LinkEvent::StateChanged { link, .. }
            | LinkEvent::TrackAdded { link, .. } => *link,
        }
    }
}

/// handed to a backend when a connection is created. callbacks may fire on any thread
#[derive(Debug, Clone)]
pub struct LinkObserver {
    peer: PeerId,
    link: LinkId,
    tx: UnboundedSender<LinkEvent>,
}

impl LinkObserver {
    pub fn new(peer: PeerId, link: LinkId, tx: UnboundedSender<LinkEvent>) -> Self {
        Self { peer, link, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEvent::Ice {
            peer: self.peer.clone(),
            link: self.link,
            candidate,
        });
    }

    pub fn connection_state(&self, state: ConnectionState) {
        self.emit(LinkEvent::StateChanged {
            peer: self.peer.clone(),
            link: self.link,
            state,
        });
    }

    pub fn track_added(&self, stream_id: impl Into<String>) {
        self.emit(LinkEvent::TrackAdded {
            link: self.link,
            stream: RemoteStream {
                peer_id: self.peer.clone(),
                stream_id: stream_id.into(),
            },
        });
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("link event for {} {} dropped: {e}", self.peer, self.link);
        }
    }
}

/// A media stack able to capture the microphone and run point-to-point audio connections.
///
/// The capture is acquired once per call and attached to every connection. Disabling it
/// silences outgoing audio without any renegotiation.
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    type Capture: Send + Sync + 'static;
    type Connection: Send + Sync + 'static;

    /// fails with [`crate::Error::MediaUnavailable`] if the microphone can't be opened
    async fn acquire_capture(&self) -> Result<Self::Capture>;

    fn set_capture_enabled(&self, capture: &Self::Capture, enabled: bool);

    async fn release_capture(&self, capture: Self::Capture);

    async fn create_connection(
        &self,
        peer: &PeerId,
        observer: LinkObserver,
    ) -> Result<Self::Connection>;

    async fn add_track(&self, connection: &Self::Connection, capture: &Self::Capture)
        -> Result<()>;

    /// creates an offer and applies it as the local description
    async fn create_offer(&self, connection: &Self::Connection) -> Result<SessionDescription>;

    /// creates an answer to the applied remote offer and applies it as the local description
    async fn create_answer(&self, connection: &Self::Connection) -> Result<SessionDescription>;

    async fn set_remote_description(
        &self,
        connection: &Self::Connection,
        sdp: SessionDescription,
    ) -> Result<()>;

    async fn add_ice_candidate(
        &self,
        connection: &Self::Connection,
        candidate: IceCandidate,
    ) -> Result<()>;

    async fn close(&self, connection: Self::Connection);
}
