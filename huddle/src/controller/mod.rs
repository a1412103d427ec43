//! The call controller runs the session, the peer links and the call timers on a single task.
//!
//! Everything that can change call state arrives on that task: commands from the UI, events from
//! the relay, events from the media backend and timer expirations. Processing is therefore
//! strictly sequential and the session never observes a half applied transition.

use std::{pin::Pin, sync::Arc};

use futures::channel::oneshot;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    time::{Instant, Interval, Sleep},
};

use crate::{
    config::Config,
    error::{Error, Result},
    media::{LinkEvent, MediaBackend},
    peers::{LinkUpdate, PeerManager},
    relay::{RelayClient, RelayHandle},
    session::{CallSession, CallState, Effect},
    signaling::RelaySignal,
    PeerId, RoomId,
};

mod events;

pub use events::{CallEvent, CallEventStream, CallSnapshot};

#[derive(Debug)]
enum Cmd {
    StartCall {
        rsp: oneshot::Sender<Result<()>>,
    },
    AcceptCall {
        rsp: oneshot::Sender<Result<()>>,
    },
    LeaveCall {
        rsp: oneshot::Sender<Result<()>>,
    },
    SetMuted {
        muted: bool,
        rsp: oneshot::Sender<Result<()>>,
    },
    GetSnapshot {
        rsp: oneshot::Sender<CallSnapshot>,
    },
}

struct NotifyWrapper {
    notify: Arc<Notify>,
}

impl Drop for NotifyWrapper {
    fn drop(&mut self) {
        self.notify.notify_waiters();
    }
}

/// Handle to the call task. Cloning is cheap; the task stops once the last clone is dropped.
#[derive(Clone)]
pub struct CallController {
    ch: UnboundedSender<Cmd>,
    event_ch: broadcast::Sender<CallEvent>,
    _notify: Arc<NotifyWrapper>,
}

pub struct Args<B: MediaBackend> {
    /// the id the relay knows this client by
    pub own_id: PeerId,
    pub own_name: String,
    pub room_id: RoomId,
    pub backend: B,
    pub relay: RelayClient,
    pub config: Config,
}

impl CallController {
    /// spawns the call task. must be called from within a tokio runtime
    pub fn new<B: MediaBackend>(args: Args<B>) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_ch, _rx) = broadcast::channel(args.config.event_channel_capacity.max(1));
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        let event_ch2 = event_ch.clone();
        tokio::spawn(async move {
            run(args, cmd_rx, event_ch2, notify2).await;
        });
        Self {
            ch: tx,
            event_ch,
            _notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub fn get_event_stream(&self) -> CallEventStream {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        CallEventStream(Box::pin(stream))
    }

    /// starts a call in the room. the microphone is acquired before anything is announced
    pub async fn start_call(&self) -> Result<()> {
        self.request(|rsp| Cmd::StartCall { rsp }).await?
    }

    /// joins the call the room is ringing with
    pub async fn accept_call(&self) -> Result<()> {
        self.request(|rsp| Cmd::AcceptCall { rsp }).await?
    }

    /// leaves the call, or cancels it if nobody joined yet
    pub async fn leave_call(&self) -> Result<()> {
        self.request(|rsp| Cmd::LeaveCall { rsp }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|rsp| Cmd::SetMuted { muted, rsp }).await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot> {
        self.request(|rsp| Cmd::GetSnapshot { rsp }).await
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(cmd(tx))
            .map_err(|_| Error::ControllerStopped)?;
        rx.await.map_err(|_| Error::ControllerStopped)
    }
}

struct CallTask<B: MediaBackend> {
    session: CallSession,
    peers: PeerManager<B>,
    relay: RelayHandle,
    event_ch: broadcast::Sender<CallEvent>,
    elapsed_secs: u64,
}

async fn run<B: MediaBackend>(
    args: Args<B>,
    mut cmd_rx: UnboundedReceiver<Cmd>,
    event_ch: broadcast::Sender<CallEvent>,
    notify: Arc<Notify>,
) {
    let Args {
        own_id,
        own_name,
        room_id,
        backend,
        relay,
        config,
    } = args;
    let RelayClient {
        handle: relay,
        incoming: mut relay_rx,
    } = relay;

    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let mut task = CallTask {
        session: CallSession::new(own_id, own_name, room_id.clone()),
        peers: PeerManager::new(backend, room_id, relay.clone(), link_tx),
        relay,
        event_ch,
        elapsed_secs: 0,
    };

    let mut timers = Timers::new(&config);
    let mut last_state = task.session.state();

    loop {
        tokio::select! {
            _ = notify.notified() => {
                log::debug!("quitting call controller");
                break;
            },
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("call controller cmd_rx channel is closed. quitting");
                        break;
                    }
                };
                task.handle_cmd(cmd).await;
            },
            opt = relay_rx.recv() => {
                let signal = match opt {
                    Some(r) => r,
                    None => {
                        log::warn!("relay connection closed. quitting call controller");
                        break;
                    }
                };
                task.handle_relay(signal).await;
            },
            opt = link_rx.recv() => {
                if let Some(event) = opt {
                    task.handle_link_event(event).await;
                }
            },
            _ = expired(&mut timers.linger) => {
                timers.linger = None;
                if task.session.finish_linger() {
                    log::debug!("call ended. back to idle");
                }
            },
            _ = ticked(&mut timers.ticker) => {
                timers.ticks += 1;
                task.elapsed_secs = timers.elapsed_secs();
                task.emit(CallEvent::Elapsed(task.elapsed_secs));
            },
        }

        let state = task.session.state();
        if state != last_state {
            log::debug!("call state: {last_state} -> {state}");
            timers.on_transition(last_state, state);
            if state != CallState::InCall {
                task.elapsed_secs = 0;
            }
            task.emit(CallEvent::StateChanged(state));
            last_state = state;
        }
    }

    task.peers.close_all().await;
}

impl<B: MediaBackend> CallTask<B> {
    fn emit(&self, event: CallEvent) {
        if let Err(e) = self.event_ch.send(event) {
            log::trace!("no listener for call event: {e}");
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            own_id: self.session.own_id().clone(),
            own_name: self.session.own_name().to_string(),
            state: self.session.state(),
            room_id: self.session.room_id().cloned(),
            host_label: self.session.host_label().map(str::to_string),
            is_muted: self.session.is_muted(),
            participants: self.session.roster().to_vec(),
            elapsed_secs: self.elapsed_secs,
            remote_streams: self.peers.remote_streams(),
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::StartCall { rsp } => {
                let r = match self.session.state() {
                    CallState::Idle | CallState::Ended => {
                        self.acquire_then(CallSession::start_call).await
                    }
                    _ => Err(Error::CallAlreadyInProgress),
                };
                let _ = rsp.send(r);
            }
            Cmd::AcceptCall { rsp } => {
                let r = match self.session.state() {
                    CallState::Ringing => self.acquire_then(CallSession::accept_call).await,
                    _ => self.session.accept_call().map(|_| ()),
                };
                let _ = rsp.send(r);
            }
            Cmd::LeaveCall { rsp } => {
                let r = match self.session.leave_call() {
                    Ok(effects) => {
                        self.apply(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = rsp.send(r);
            }
            Cmd::SetMuted { muted, rsp } => {
                let r = match self.session.set_muted(muted) {
                    Ok(effects) => {
                        self.apply(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = rsp.send(r);
            }
            Cmd::GetSnapshot { rsp } => {
                let _ = rsp.send(self.snapshot());
            }
        }
    }

    /// the microphone has to be available before the relay hears about the call
    async fn acquire_then(
        &mut self,
        transition: fn(&mut CallSession) -> Result<Vec<Effect>>,
    ) -> Result<()> {
        if let Err(e) = self.peers.ensure_local_capture().await {
            log::error!("failed to acquire microphone: {e}");
            return Err(e);
        }
        match transition(&mut self.session) {
            Ok(effects) => {
                self.apply(effects).await;
                Ok(())
            }
            Err(e) => {
                self.peers.close_all().await;
                Err(e)
            }
        }
    }

    async fn handle_relay(&mut self, signal: RelaySignal) {
        if signal.is_peer_signal() {
            self.handle_peer_signal(signal).await;
            return;
        }
        match self.session.handle_relay(&signal) {
            Ok(effects) => self.apply(effects).await,
            Err(e) if e.is_stale() => log::debug!("ignoring {e}"),
            Err(e) => log::error!("failed to handle {signal}: {e}"),
        }
    }

    async fn handle_peer_signal(&mut self, signal: RelaySignal) {
        if signal.room_id() != Some(self.session.room()) {
            log::debug!("ignoring {signal} for another room");
            return;
        }
        let from = match &signal {
            RelaySignal::CallOffer { from, .. }
            | RelaySignal::CallAnswer { from, .. }
            | RelaySignal::CallIceCandidate { from, .. } => from,
            _ => return,
        };
        if let Err(e) = self.session.check_peer_signal(from) {
            log::debug!("ignoring {signal}: {e}");
            return;
        }
        let (peer, r) = match signal {
            RelaySignal::CallOffer { from, sdp, .. } => {
                let r = self.peers.accept_offer(&from, sdp).await;
                (from, r)
            }
            RelaySignal::CallAnswer { from, sdp, .. } => {
                let r = self.peers.apply_answer(&from, sdp).await;
                (from, r)
            }
            RelaySignal::CallIceCandidate {
                from, candidate, ..
            } => {
                let r = self.peers.apply_remote_candidate(&from, candidate).await;
                (from, r)
            }
            _ => return,
        };
        match r {
            Ok(()) => {}
            Err(e) if e.is_fatal_to_peer() => self.peer_failed(peer, e),
            Err(e) => log::warn!("signal from {peer} not applied: {e}"),
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match self.peers.handle_event(event) {
            Some(LinkUpdate::StreamAdded(stream)) => {
                self.emit(CallEvent::RemoteStreamAdded(stream));
            }
            Some(LinkUpdate::Failed(peer)) => {
                if let Some(stream) = self.peers.close_link(&peer).await {
                    self.emit(CallEvent::RemoteStreamRemoved(stream));
                }
                self.peer_failed(peer.clone(), Error::negotiation(&peer, "connection failed"));
            }
            Some(LinkUpdate::Connected(peer)) => {
                log::debug!("audio link to {peer} is up");
            }
            None => {}
        }
    }

    fn peer_failed(&self, peer_id: PeerId, e: Error) {
        log::warn!("dropping link to {peer_id}: {e}");
        self.emit(CallEvent::PeerFailed {
            peer_id,
            reason: e.to_string(),
        });
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(signal) => {
                    if let Err(e) = self.relay.send(signal) {
                        log::error!("failed to send signal: {e}");
                    }
                }
                Effect::OfferTo(peers) => {
                    for peer in peers {
                        // the other side may have offered first
                        if self.peers.has_link(&peer) {
                            continue;
                        }
                        if let Err(e) = self.peers.initiate_offer(&peer).await {
                            self.peer_failed(peer, e);
                        }
                    }
                }
                Effect::CloseLink(peer) => {
                    if let Some(stream) = self.peers.close_link(&peer).await {
                        self.emit(CallEvent::RemoteStreamRemoved(stream));
                    }
                }
                Effect::CloseAll => {
                    for stream in self.peers.close_all().await {
                        self.emit(CallEvent::RemoteStreamRemoved(stream));
                    }
                }
                Effect::SetLocalMute(muted) => self.peers.set_local_mute(muted),
                Effect::ParticipantJoined(participant) => {
                    self.emit(CallEvent::ParticipantJoined(participant))
                }
                Effect::ParticipantLeft(peer_id) => self.emit(CallEvent::ParticipantLeft(peer_id)),
                Effect::ParticipantMuted { peer_id, muted } => {
                    self.emit(CallEvent::ParticipantMuted { peer_id, muted })
                }
                Effect::Declined { username } => self.emit(CallEvent::CallDeclined { username }),
            }
        }
    }
}

/// the Ended linger and the in-call elapsed counter. both derive from state transitions
struct Timers {
    linger_for: std::time::Duration,
    tick_every: std::time::Duration,
    linger: Option<Pin<Box<Sleep>>>,
    ticker: Option<Interval>,
    ticks: u64,
}

impl Timers {
    fn new(config: &Config) -> Self {
        Self {
            linger_for: config.ended_linger(),
            tick_every: config.elapsed_tick(),
            linger: None,
            ticker: None,
            ticks: 0,
        }
    }

    fn on_transition(&mut self, from: CallState, to: CallState) {
        self.linger = match to {
            CallState::Ended => Some(Box::pin(tokio::time::sleep(self.linger_for))),
            _ => None,
        };
        if to == CallState::InCall {
            self.ticks = 0;
            self.ticker = Some(tokio::time::interval_at(
                Instant::now() + self.tick_every,
                self.tick_every,
            ));
        } else if from == CallState::InCall {
            self.ticks = 0;
            self.ticker = None;
        }
    }

    fn elapsed_secs(&self) -> u64 {
        (self.ticks * self.tick_every.as_millis() as u64) / 1000
    }
}

async fn expired(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep.as_mut() {
        Some(sleep) => sleep.await,
        None => futures::future::pending().await,
    }
}

async fn ticked(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}
