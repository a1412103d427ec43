//! One link per remote participant, all sharing a single microphone capture.
//!
//! The manager is driven from two directions:
//! - by the call session: `initiate_offer`, `set_local_mute`, `close_link`, `close_all`
//! - by peer signals relayed from other clients: `accept_offer`, `apply_answer`,
//!   `apply_remote_candidate`
//!
//! Events raised by the backend arrive through `handle_event`. Local candidates are forwarded to
//! the relay from there, remote audio is recorded on its link.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::{
    error::{Error, Result},
    media::{ConnectionState, LinkEvent, LinkId, LinkObserver, MediaBackend, RemoteStream},
    relay::RelayHandle,
    signaling::{ClientSignal, IceCandidate, SessionDescription},
    PeerId, RoomId,
};

/// what the controller has to know about after a link event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUpdate {
    StreamAdded(RemoteStream),
    Connected(PeerId),
    /// the link can't recover. the controller closes it
    Failed(PeerId),
}

struct PeerLink<C> {
    id: LinkId,
    connection: C,
    stream: Option<RemoteStream>,
}

pub struct PeerManager<B: MediaBackend> {
    backend: B,
    room_id: RoomId,
    relay: RelayHandle,
    event_tx: UnboundedSender<LinkEvent>,
    links: HashMap<PeerId, PeerLink<B::Connection>>,
    next_link: u64,
    capture: Option<B::Capture>,
    /// applied to the capture whenever it exists
    muted: bool,
}

impl<B: MediaBackend> PeerManager<B> {
    pub fn new(
        backend: B,
        room_id: RoomId,
        relay: RelayHandle,
        event_tx: UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            backend,
            room_id,
            relay,
            event_tx,
            links: HashMap::new(),
            next_link: 0,
            capture: None,
            muted: false,
        }
    }

    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn has_capture(&self) -> bool {
        self.capture.is_some()
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        let mut streams: Vec<RemoteStream> = self
            .links
            .values()
            .filter_map(|link| link.stream.clone())
            .collect();
        streams.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        streams
    }

    /// acquires the microphone once and reuses it for every later link
    pub async fn ensure_local_capture(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let capture = self.backend.acquire_capture().await?;
        self.backend.set_capture_enabled(&capture, !self.muted);
        self.capture = Some(capture);
        Ok(())
    }

    /// returns false if a link to `peer` already existed
    pub async fn open_link(&mut self, peer: &PeerId) -> Result<bool> {
        if self.links.contains_key(peer) {
            return Ok(false);
        }
        self.ensure_local_capture().await?;

        self.next_link += 1;
        let id = LinkId(self.next_link);
        let observer = LinkObserver::new(peer.clone(), id, self.event_tx.clone());
        let connection = self.backend.create_connection(peer, observer).await?;
        if let Some(capture) = self.capture.as_ref() {
            if let Err(e) = self.backend.add_track(&connection, capture).await {
                self.backend.close(connection).await;
                return Err(Error::negotiation(peer, e));
            }
        }
        log::debug!("opened link {id} to {peer}");
        self.links.insert(
            peer.clone(),
            PeerLink {
                id,
                connection,
                stream: None,
            },
        );
        Ok(true)
    }

    /// opens a link if needed and sends it an offer
    pub async fn initiate_offer(&mut self, peer: &PeerId) -> Result<()> {
        let r = self.try_offer(peer).await;
        self.fail_link_on_err(peer, r).await
    }

    async fn try_offer(&mut self, peer: &PeerId) -> Result<()> {
        self.open_link(peer).await?;
        let link = self.link(peer)?;
        let sdp = self
            .backend
            .create_offer(&link.connection)
            .await
            .map_err(|e| Error::negotiation(peer, e))?;
        self.relay.send(ClientSignal::CallOffer {
            room_id: self.room_id.clone(),
            to: peer.clone(),
            sdp,
        })
    }

    /// answers an offer from `from`, reusing its link if one exists
    pub async fn accept_offer(&mut self, from: &PeerId, sdp: SessionDescription) -> Result<()> {
        let r = self.try_answer(from, sdp).await;
        self.fail_link_on_err(from, r).await
    }

    async fn try_answer(&mut self, from: &PeerId, sdp: SessionDescription) -> Result<()> {
        self.open_link(from).await?;
        let link = self.link(from)?;
        self.backend
            .set_remote_description(&link.connection, sdp)
            .await
            .map_err(|e| Error::negotiation(from, e))?;
        let answer = self
            .backend
            .create_answer(&link.connection)
            .await
            .map_err(|e| Error::negotiation(from, e))?;
        self.relay.send(ClientSignal::CallAnswer {
            room_id: self.room_id.clone(),
            to: from.clone(),
            sdp: answer,
        })
    }

    /// an answer for a link that is gone is dropped
    pub async fn apply_answer(&mut self, from: &PeerId, sdp: SessionDescription) -> Result<()> {
        let Some(link) = self.links.get(from) else {
            log::debug!("dropping answer from {from}: no link");
            return Ok(());
        };
        let r = self
            .backend
            .set_remote_description(&link.connection, sdp)
            .await
            .map_err(|e| Error::negotiation(from, e));
        self.fail_link_on_err(from, r).await
    }

    /// a candidate for a link that is gone is dropped. a bad candidate is logged and skipped
    pub async fn apply_remote_candidate(
        &mut self,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(link) = self.links.get(from) else {
            log::debug!("dropping candidate from {from}: no link");
            return Ok(());
        };
        if let Err(e) = self.backend.add_ice_candidate(&link.connection, candidate).await {
            log::warn!("failed to add ice candidate from {from}: {e}");
        }
        Ok(())
    }

    /// enables or disables the outgoing audio on every link. never renegotiates
    pub fn set_local_mute(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(capture) = self.capture.as_ref() {
            self.backend.set_capture_enabled(capture, !muted);
        }
    }

    /// returns the remote stream the link carried, so it can be pruned from the view
    pub async fn close_link(&mut self, peer: &PeerId) -> Option<RemoteStream> {
        let link = self.links.remove(peer)?;
        log::debug!("closing link to {peer}");
        self.backend.close(link.connection).await;
        link.stream
    }

    /// closes every link and releases the microphone. safe to call repeatedly
    pub async fn close_all(&mut self) -> Vec<RemoteStream> {
        let mut removed = vec![];
        for (peer, link) in self.links.drain() {
            log::debug!("closing link to {peer}");
            self.backend.close(link.connection).await;
            removed.extend(link.stream);
        }
        if let Some(capture) = self.capture.take() {
            self.backend.release_capture(capture).await;
        }
        self.muted = false;
        removed
    }

    pub fn handle_event(&mut self, event: LinkEvent) -> Option<LinkUpdate> {
        let peer = event.peer().clone();
        let Some(link) = self.links.get_mut(&peer) else {
            log::trace!("dropping {event} for closed link to {peer}");
            return None;
        };
        // raised by an earlier connection to the same peer
        if link.id != event.link() {
            log::trace!("dropping {event} from link {} to {peer}", event.link());
            return None;
        }
        match event {
            LinkEvent::Ice { candidate, .. } => {
                let signal = ClientSignal::CallIceCandidate {
                    room_id: self.room_id.clone(),
                    to: peer,
                    candidate,
                };
                if let Err(e) = self.relay.send(signal) {
                    log::error!("failed to send ice candidate: {e}");
                }
                None
            }
            LinkEvent::TrackAdded { stream, .. } => {
                link.stream = Some(stream.clone());
                Some(LinkUpdate::StreamAdded(stream))
            }
            LinkEvent::StateChanged { state, .. } => match state {
                ConnectionState::Connected => {
                    log::info!("connected to {peer}");
                    Some(LinkUpdate::Connected(peer))
                }
                ConnectionState::Failed => {
                    log::warn!("connection to {peer} failed");
                    Some(LinkUpdate::Failed(peer))
                }
                other => {
                    log::debug!("connection to {peer}: {other}");
                    None
                }
            },
        }
    }

    fn link(&self, peer: &PeerId) -> Result<&PeerLink<B::Connection>> {
        self.links
            .get(peer)
            .ok_or_else(|| Error::negotiation(peer, "link closed during negotiation"))
    }

    async fn fail_link_on_err(&mut self, peer: &PeerId, r: Result<()>) -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close_link(peer).await;
                match e {
                    e @ (Error::NegotiationFailure { .. } | Error::MediaUnavailable(_)) => Err(e),
                    other => Err(Error::negotiation(peer, other)),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::{loopback::LoopbackBackend, relay};

    struct Harness {
        peers: PeerManager<LoopbackBackend>,
        backend: LoopbackBackend,
        sent: UnboundedReceiver<ClientSignal>,
        events: UnboundedReceiver<LinkEvent>,
        _incoming: relay::RelayClient,
    }

    fn harness() -> Harness {
        let backend = LoopbackBackend::default();
        let (client, endpoint) = relay::pair();
        let (event_tx, events) = mpsc::unbounded_channel();
        let peers = PeerManager::new(
            backend.clone(),
            "ROOM".into(),
            client.handle.clone(),
            event_tx,
        );
        Harness {
            peers,
            backend,
            sent: endpoint.outgoing,
            events,
            _incoming: client,
        }
    }

    fn sent(rx: &mut UnboundedReceiver<ClientSignal>) -> Vec<ClientSignal> {
        let mut out = vec![];
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[tokio::test]
    async fn capture_acquired_once_for_many_links() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers.initiate_offer(&"a".into()).await?;
        h.peers.initiate_offer(&"b".into()).await?;
        assert_eq!(h.peers.link_count(), 2);
        let stats = h.backend.stats();
        assert_eq!(stats.captures_acquired, 1);
        assert_eq!(stats.tracks_added, 2);

        let offers = sent(&mut h.sent)
            .into_iter()
            .filter(|s| matches!(s, ClientSignal::CallOffer { .. }))
            .count();
        assert_eq!(offers, 2);
        Ok(())
    }

    #[tokio::test]
    async fn open_link_is_idempotent() -> anyhow::Result<()> {
        let mut h = harness();
        assert!(h.peers.open_link(&"a".into()).await?);
        assert!(!h.peers.open_link(&"a".into()).await?);
        assert_eq!(h.backend.stats().connections_created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn offer_is_answered_on_the_same_link() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers
            .accept_offer(&"a".into(), SessionDescription::offer("v=0"))
            .await?;
        let signals = sent(&mut h.sent);
        assert!(matches!(
            signals.as_slice(),
            [ClientSignal::CallAnswer { to, .. }] if to == &PeerId::from("a")
        ));
        assert_eq!(h.backend.stats().connections_created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_answer_and_candidate_are_dropped() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers
            .apply_answer(&"gone".into(), SessionDescription::answer("v=0"))
            .await?;
        h.peers
            .apply_remote_candidate(
                &"gone".into(),
                IceCandidate {
                    candidate: "candidate:0".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                },
            )
            .await?;
        assert_eq!(h.peers.link_count(), 0);
        let stats = h.backend.stats();
        assert_eq!(stats.remote_descriptions, 0);
        assert_eq!(stats.candidates_added, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_negotiation_closes_only_that_link() -> anyhow::Result<()> {
        let mut h = harness();
        h.backend.fail_negotiation_with(&"bad".into());
        h.peers.initiate_offer(&"good".into()).await?;
        let r = h.peers.initiate_offer(&"bad".into()).await;
        assert!(matches!(
            r,
            Err(Error::NegotiationFailure { ref peer_id, .. }) if peer_id == &PeerId::from("bad")
        ));
        assert!(h.peers.has_link(&"good".into()));
        assert!(!h.peers.has_link(&"bad".into()));
        Ok(())
    }

    #[tokio::test]
    async fn capture_failure_opens_nothing() {
        let mut h = harness();
        h.backend.fail_capture(true);
        let r = h.peers.initiate_offer(&"a".into()).await;
        assert!(matches!(r, Err(Error::MediaUnavailable(_))));
        assert_eq!(h.peers.link_count(), 0);
        assert!(sent(&mut h.sent).is_empty());
    }

    #[tokio::test]
    async fn mute_toggles_capture_without_renegotiation() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers.initiate_offer(&"a".into()).await?;
        h.peers.initiate_offer(&"b".into()).await?;
        h.peers.set_local_mute(true);
        assert_eq!(h.backend.stats().capture_enabled, Some(false));
        h.peers.set_local_mute(false);
        assert_eq!(h.backend.stats().capture_enabled, Some(true));
        assert_eq!(h.backend.stats().offers, 2);
        assert_eq!(h.peers.link_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn mute_before_capture_applies_on_acquire() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers.set_local_mute(true);
        h.peers.ensure_local_capture().await?;
        assert_eq!(h.backend.stats().capture_enabled, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn close_all_releases_capture_and_is_repeatable() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers.initiate_offer(&"a".into()).await?;
        h.peers.initiate_offer(&"b".into()).await?;
        h.peers.close_all().await;
        h.peers.close_all().await;
        let stats = h.backend.stats();
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.captures_released, 1);
        assert!(!h.peers.has_capture());
        Ok(())
    }

    #[tokio::test]
    async fn events_route_candidates_and_streams() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers
            .accept_offer(&"a".into(), SessionDescription::offer("v=0"))
            .await?;
        sent(&mut h.sent);

        let mut updates = vec![];
        while let Ok(event) = h.events.try_recv() {
            updates.extend(h.peers.handle_event(event));
        }
        assert!(updates
            .iter()
            .any(|u| matches!(u, LinkUpdate::StreamAdded(s) if s.peer_id == PeerId::from("a"))));
        assert_eq!(h.peers.remote_streams().len(), 1);
        assert!(sent(&mut h.sent)
            .iter()
            .any(|s| matches!(s, ClientSignal::CallIceCandidate { to, .. } if to == &PeerId::from("a"))));

        let stream = h.peers.close_link(&"a".into()).await;
        assert!(stream.is_some());
        assert!(h.peers.remote_streams().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn events_for_closed_links_are_dropped() -> anyhow::Result<()> {
        let mut h = harness();
        h.peers.initiate_offer(&"a".into()).await?;
        h.peers.close_link(&"a".into()).await;
        sent(&mut h.sent);
        while let Ok(event) = h.events.try_recv() {
            assert!(h.peers.handle_event(event).is_none());
        }
        assert!(sent(&mut h.sent).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn events_from_a_replaced_link_are_dropped() -> anyhow::Result<()> {
        let mut h = harness();
        let peer = PeerId::from("a");
        h.peers.initiate_offer(&peer).await?;
        let first = match h.events.try_recv() {
            Ok(event) => event.link(),
            Err(e) => anyhow::bail!("no event from the first link: {e}"),
        };
        h.peers.close_link(&peer).await;
        h.peers.initiate_offer(&peer).await?;
        sent(&mut h.sent);

        // the queued candidate of the first link must not reach the peer on the second one
        while let Ok(event) = h.events.try_recv() {
            h.peers.handle_event(event);
        }
        let candidates = sent(&mut h.sent)
            .into_iter()
            .filter(|s| matches!(s, ClientSignal::CallIceCandidate { .. }))
            .count();
        assert_eq!(candidates, 1);

        let late_failure = LinkEvent::StateChanged {
            peer: peer.clone(),
            link: first,
            state: ConnectionState::Failed,
        };
        assert!(h.peers.handle_event(late_failure).is_none());
        assert!(h.peers.has_link(&peer));
        Ok(())
    }
}
