//! An in-process [`MediaBackend`] with no audio hardware and no network.
//!
//! Connections "connect" as soon as a remote description is applied: the observer then reports a
//! connected state and a remote stream. Every call is counted so tests can assert on what the call
//! logic asked of the media stack.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    media::{ConnectionState, LinkObserver, MediaBackend},
    signaling::{IceCandidate, SessionDescription},
    PeerId,
};

/// what the backend was asked to do so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub captures_acquired: usize,
    pub captures_released: usize,
    /// None while no capture is held
    pub capture_enabled: Option<bool>,
    pub connections_created: usize,
    pub tracks_added: usize,
    pub offers: usize,
    pub answers: usize,
    pub remote_descriptions: usize,
    pub candidates_added: usize,
    pub closed: usize,
}

#[derive(Default)]
struct Inner {
    stats: LoopbackStats,
    fail_capture: bool,
    fail_negotiation: HashSet<PeerId>,
    open: Vec<(Uuid, LinkObserver)>,
}

#[derive(Clone, Default)]
pub struct LoopbackBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
pub struct LoopbackCapture {
    id: Uuid,
}

#[derive(Debug)]
pub struct LoopbackConnection {
    id: Uuid,
    peer: PeerId,
    observer: LinkObserver,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> LoopbackStats {
        self.inner.lock().stats.clone()
    }

    /// makes every later `acquire_capture` fail, as if the microphone permission was denied
    pub fn fail_capture(&self, fail: bool) {
        self.inner.lock().fail_capture = fail;
    }

    /// makes offers, answers and remote descriptions toward `peer` fail
    pub fn fail_negotiation_with(&self, peer: &PeerId) {
        self.inner.lock().fail_negotiation.insert(peer.clone());
    }

    /// reports the link to `peer` as failed, as an ICE failure would
    pub fn drop_link(&self, peer: &PeerId) {
        let inner = self.inner.lock();
        for (_, observer) in inner.open.iter().filter(|(_, o)| o.peer() == peer) {
            observer.connection_state(ConnectionState::Failed);
        }
    }

    fn check_negotiation(&self, connection: &LoopbackConnection) -> Result<()> {
        if self.inner.lock().fail_negotiation.contains(&connection.peer) {
            return Err(Error::negotiation(&connection.peer, "loopback refused"));
        }
        Ok(())
    }
}

fn fake_sdp(kind: &str, id: &Uuid) -> String {
    format!(
        "v=0\r\no=loopback {id} 0 IN IP4 127.0.0.1\r\ns={kind}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"
    )
}

#[async_trait]
impl MediaBackend for LoopbackBackend {
    type Capture = LoopbackCapture;
    type Connection = LoopbackConnection;

    async fn acquire_capture(&self) -> Result<LoopbackCapture> {
        let mut inner = self.inner.lock();
        if inner.fail_capture {
            return Err(Error::MediaUnavailable("permission denied".into()));
        }
        inner.stats.captures_acquired += 1;
        inner.stats.capture_enabled = Some(true);
        Ok(LoopbackCapture { id: Uuid::new_v4() })
    }

    fn set_capture_enabled(&self, capture: &LoopbackCapture, enabled: bool) {
        log::trace!("capture {} enabled: {enabled}", capture.id);
        self.inner.lock().stats.capture_enabled = Some(enabled);
    }

    async fn release_capture(&self, capture: LoopbackCapture) {
        log::trace!("releasing capture {}", capture.id);
        let mut inner = self.inner.lock();
        inner.stats.captures_released += 1;
        inner.stats.capture_enabled = None;
    }

    async fn create_connection(
        &self,
        peer: &PeerId,
        observer: LinkObserver,
    ) -> Result<LoopbackConnection> {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        inner.stats.connections_created += 1;
        inner.open.push((id, observer.clone()));
        observer.connection_state(ConnectionState::New);
        Ok(LoopbackConnection {
            id,
            peer: peer.clone(),
            observer,
        })
    }

    async fn add_track(
        &self,
        _connection: &LoopbackConnection,
        _capture: &LoopbackCapture,
    ) -> Result<()> {
        self.inner.lock().stats.tracks_added += 1;
        Ok(())
    }

    async fn create_offer(&self, connection: &LoopbackConnection) -> Result<SessionDescription> {
        self.check_negotiation(connection)?;
        self.inner.lock().stats.offers += 1;
        connection.observer.ice_candidate(local_candidate(&connection.id));
        Ok(SessionDescription::offer(fake_sdp("offer", &connection.id)))
    }

    async fn create_answer(&self, connection: &LoopbackConnection) -> Result<SessionDescription> {
        self.check_negotiation(connection)?;
        self.inner.lock().stats.answers += 1;
        connection.observer.ice_candidate(local_candidate(&connection.id));
        Ok(SessionDescription::answer(fake_sdp("answer", &connection.id)))
    }

    async fn set_remote_description(
        &self,
        connection: &LoopbackConnection,
        _sdp: SessionDescription,
    ) -> Result<()> {
        self.check_negotiation(connection)?;
        self.inner.lock().stats.remote_descriptions += 1;
        connection
            .observer
            .connection_state(ConnectionState::Connected);
        connection.observer.track_added(Uuid::new_v4().to_string());
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        _connection: &LoopbackConnection,
        _candidate: IceCandidate,
    ) -> Result<()> {
        self.inner.lock().stats.candidates_added += 1;
        Ok(())
    }

    async fn close(&self, connection: LoopbackConnection) {
        let mut inner = self.inner.lock();
        inner.stats.closed += 1;
        inner.open.retain(|(id, _)| id != &connection.id);
        connection
            .observer
            .connection_state(ConnectionState::Closed);
    }
}

fn local_candidate(id: &Uuid) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host",
            id.as_u128() % 10_000
        ),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
