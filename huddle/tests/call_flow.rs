//! Whole-call scenarios: several clients, each with its own controller and loopback media,
//! talking through an in-memory relay that behaves like the room server.

use std::{sync::Arc, time::Duration};

use huddle::{
    config::Config,
    controller::Args,
    loopback::LoopbackBackend,
    relay,
    signaling::{ClientSignal, ParticipantInfo, RelaySignal, SessionDescription},
    CallController, CallSnapshot, CallState, PeerId, RoomId,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

const ROOM: &str = "ROOM1";

struct ActiveCall {
    participants: Vec<ParticipantInfo>,
    host: String,
}

#[derive(Default)]
struct Room {
    members: IndexMap<PeerId, UnboundedSender<RelaySignal>>,
    call: Option<ActiveCall>,
    /// every frame the clients sent, in relay order
    log: Vec<(PeerId, ClientSignal)>,
}

impl Room {
    fn broadcast(&self, signal: RelaySignal) {
        for tx in self.members.values() {
            let _ = tx.send(signal.clone());
        }
    }

    fn broadcast_except(&self, except: &PeerId, signal: RelaySignal) {
        for (id, tx) in self.members.iter() {
            if id != except {
                let _ = tx.send(signal.clone());
            }
        }
    }

    fn unicast(&self, to: &PeerId, signal: RelaySignal) {
        if let Some(tx) = self.members.get(to) {
            let _ = tx.send(signal);
        }
    }

    fn handle(&mut self, from: &PeerId, signal: ClientSignal) {
        self.log.push((from.clone(), signal.clone()));
        match signal {
            ClientSignal::CallStart {
                room_id,
                username,
                peer_id,
            } => {
                let participants = vec![ParticipantInfo {
                    id: peer_id.clone(),
                    username: username.clone(),
                }];
                self.call = Some(ActiveCall {
                    participants: participants.clone(),
                    host: username.clone(),
                });
                self.broadcast(RelaySignal::IncomingCall {
                    caller: username,
                    caller_id: peer_id,
                    room_id,
                    participants,
                });
            }
            ClientSignal::CallAccept {
                username, peer_id, ..
            } => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                if !call.participants.iter().any(|p| p.id == peer_id) {
                    call.participants.push(ParticipantInfo {
                        id: peer_id.clone(),
                        username: username.clone(),
                    });
                }
                let participants = call.participants.clone();
                self.broadcast(RelaySignal::CallUserJoined {
                    peer_id,
                    username,
                    participants,
                });
            }
            ClientSignal::CallLeave { .. } => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                let username = call
                    .participants
                    .iter()
                    .find(|p| &p.id == from)
                    .map(|p| p.username.clone());
                call.participants.retain(|p| &p.id != from);
                let room_empty = call.participants.is_empty();
                if room_empty {
                    self.call = None;
                }
                self.broadcast(RelaySignal::CallUserLeft {
                    peer_id: from.clone(),
                    username,
                    room_empty,
                });
            }
            ClientSignal::CallMute { muted, .. } => {
                self.broadcast_except(
                    from,
                    RelaySignal::CallUserMuted {
                        peer_id: from.clone(),
                        muted,
                    },
                );
            }
            ClientSignal::CallOffer { room_id, to, sdp } => self.unicast(
                &to,
                RelaySignal::CallOffer {
                    room_id,
                    from: from.clone(),
                    sdp,
                },
            ),
            ClientSignal::CallAnswer { room_id, to, sdp } => self.unicast(
                &to,
                RelaySignal::CallAnswer {
                    room_id,
                    from: from.clone(),
                    sdp,
                },
            ),
            ClientSignal::CallIceCandidate {
                room_id,
                to,
                candidate,
            } => self.unicast(
                &to,
                RelaySignal::CallIceCandidate {
                    room_id,
                    from: from.clone(),
                    candidate,
                },
            ),
        }
    }
}

#[derive(Clone, Default)]
struct FakeRelay {
    room: Arc<Mutex<Room>>,
}

struct Client {
    id: PeerId,
    controller: CallController,
    backend: LoopbackBackend,
}

impl FakeRelay {
    /// connects a client to the room. a running call is announced to it right away
    fn join(&self, id: &str) -> Client {
        let (client, mut endpoint) = relay::pair();
        let peer_id = PeerId::from(id);
        let backend = LoopbackBackend::new();
        {
            let mut room = self.room.lock();
            if let Some(call) = room.call.as_ref() {
                let _ = endpoint.incoming.send(RelaySignal::CallExisting {
                    room_id: ROOM.into(),
                    host_name: Some(call.host.clone()),
                    participants: call.participants.clone(),
                });
            }
            room.members
                .insert(peer_id.clone(), endpoint.incoming.clone());
        }

        let controller = CallController::new(Args {
            own_id: peer_id.clone(),
            own_name: id.to_string(),
            room_id: RoomId::from(ROOM),
            backend: backend.clone(),
            relay: client,
            config: Config::default(),
        });

        let room = self.room.clone();
        let from = peer_id.clone();
        tokio::spawn(async move {
            while let Some(signal) = endpoint.outgoing.recv().await {
                room.lock().handle(&from, signal);
            }
        });

        Client {
            id: peer_id,
            controller,
            backend,
        }
    }

    fn inject(&self, to: &PeerId, signal: RelaySignal) {
        self.room.lock().unicast(to, signal);
    }

    fn count_sent(&self, f: impl Fn(&PeerId, &ClientSignal) -> bool) -> usize {
        self.room
            .lock()
            .log
            .iter()
            .filter(|(from, signal)| f(from, signal))
            .count()
    }

    fn offers(&self, from: &PeerId, to: &PeerId) -> usize {
        self.count_sent(|f, s| {
            f == from && matches!(s, ClientSignal::CallOffer { to: t, .. } if t == to)
        })
    }
}

async fn until(
    client: &Client,
    what: &str,
    f: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let r = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = client.controller.snapshot().await.expect("controller running");
            if f(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    r.unwrap_or_else(|_| panic!("{}: timed out waiting for {what}", client.id))
}

fn members(snapshot: &CallSnapshot) -> Vec<&str> {
    snapshot
        .participants
        .iter()
        .map(|p| p.peer_id.as_str())
        .collect()
}

fn streams_from(snapshot: &CallSnapshot) -> Vec<&str> {
    snapshot
        .remote_streams
        .iter()
        .map(|s| s.peer_id.as_str())
        .collect()
}

/// a calls, b and then c join. returns once every pair is linked
async fn three_party_call(relay: &FakeRelay) -> (Client, Client, Client) {
    let a = relay.join("a");
    let b = relay.join("b");
    let c = relay.join("c");

    a.controller.start_call().await.expect("start");
    until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    b.controller.accept_call().await.expect("b accepts");
    until(&a, "a in call with b", |s| s.remote_streams.len() == 1).await;

    until(&c, "c sees b", |s| s.participants.len() == 2).await;
    c.controller.accept_call().await.expect("c accepts");
    for client in [&a, &b, &c] {
        until(client, "full mesh", |s| s.remote_streams.len() == 2).await;
    }
    (a, b, c)
}

#[tokio::test(start_paused = true)]
async fn two_party_call_joiner_offers_once() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");

    a.controller.start_call().await?;
    let snapshot = until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    assert_eq!(snapshot.host_label.as_deref(), Some("a"));

    // the caller's own announcement keeps it Calling with nobody listed
    let snapshot = a.controller.snapshot().await?;
    assert_eq!(snapshot.state, CallState::Calling);
    assert!(snapshot.participants.is_empty());

    b.controller.accept_call().await?;
    let sa = until(&a, "a linked", |s| s.remote_streams.len() == 1).await;
    let sb = until(&b, "b linked", |s| s.remote_streams.len() == 1).await;

    assert_eq!(sa.state, CallState::InCall);
    assert_eq!(sb.state, CallState::InCall);
    assert_eq!(members(&sa), vec!["a", "b"]);
    assert_eq!(members(&sb), vec!["a", "b"]);
    assert_eq!(streams_from(&sa), vec!["b"]);
    assert_eq!(streams_from(&sb), vec!["a"]);

    assert_eq!(relay.offers(&b.id, &a.id), 1);
    assert_eq!(relay.offers(&a.id, &b.id), 0);
    assert_eq!(a.backend.stats().connections_created, 1);
    assert_eq!(b.backend.stats().connections_created, 1);
    assert_eq!(a.backend.stats().captures_acquired, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn host_leaving_keeps_the_survivors_linked() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let (a, b, c) = three_party_call(&relay).await;
    assert_eq!(relay.offers(&c.id, &a.id), 1);
    assert_eq!(relay.offers(&c.id, &b.id), 1);

    a.controller.leave_call().await?;

    for (survivor, other) in [(&b, "c"), (&c, "b")] {
        let snapshot = until(survivor, "host gone", |s| s.participants.len() == 2).await;
        assert_eq!(snapshot.state, CallState::InCall);
        assert!(!members(&snapshot).contains(&"a"));
        assert_eq!(streams_from(&snapshot), vec![other]);
        let stats = survivor.backend.stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.captures_released, 0);
    }

    // the call goes on without the host, who can rejoin it
    let snapshot = until(&a, "host back to ringing", |s| s.state == CallState::Ringing).await;
    assert_eq!(members(&snapshot), vec!["b", "c"]);
    assert!(snapshot.remote_streams.is_empty());
    assert_eq!(a.backend.stats().captures_released, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn last_one_out_ends_the_call_for_everyone() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");

    a.controller.start_call().await?;
    until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    b.controller.accept_call().await?;
    until(&a, "a linked", |s| s.remote_streams.len() == 1).await;

    b.controller.leave_call().await?;
    until(&b, "b ringing", |s| s.state == CallState::Ringing).await;
    let snapshot = until(&a, "a alone", |s| s.participants.len() == 1).await;
    assert_eq!(snapshot.state, CallState::InCall);

    a.controller.leave_call().await?;
    for client in [&a, &b] {
        let snapshot = until(client, "ended", |s| s.state == CallState::Ended).await;
        assert!(snapshot.participants.is_empty());
    }

    tokio::time::sleep(Duration::from_millis(900)).await;
    for client in [&a, &b] {
        let snapshot = client.controller.snapshot().await?;
        assert_eq!(snapshot.state, CallState::Idle);
        assert!(snapshot.participants.is_empty());
        assert!(snapshot.host_label.is_none());
        assert!(snapshot.room_id.is_none());
        assert!(snapshot.remote_streams.is_empty());
        let stats = client.backend.stats();
        assert_eq!(stats.captures_acquired, stats.captures_released);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ended_lingers_for_the_configured_delay() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");

    a.controller.start_call().await?;
    until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    a.controller.leave_call().await?;
    assert_eq!(a.controller.snapshot().await?.state, CallState::Idle);

    until(&b, "ended", |s| s.state == CallState::Ended).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(b.controller.snapshot().await?.state, CallState::Ended);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b.controller.snapshot().await?.state, CallState::Idle);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn muting_never_renegotiates() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let (a, b, c) = three_party_call(&relay).await;
    let offers_before = relay.count_sent(|_, s| matches!(s, ClientSignal::CallOffer { .. }));
    let stats_before = b.backend.stats();

    b.controller.set_muted(true).await?;
    assert_eq!(b.backend.stats().capture_enabled, Some(false));

    for client in [&a, &c] {
        until(client, "b shown muted", |s| {
            s.participants
                .iter()
                .any(|p| p.peer_id.as_str() == "b" && p.muted)
        })
        .await;
    }
    let stats_after = b.backend.stats();
    assert_eq!(stats_after.offers, stats_before.offers);
    assert_eq!(stats_after.answers, stats_before.answers);
    assert_eq!(stats_after.closed, 0);
    assert_eq!(
        relay.count_sent(|_, s| matches!(s, ClientSignal::CallOffer { .. })),
        offers_before
    );
    assert_eq!(
        relay.count_sent(|f, s| f == &b.id && matches!(s, ClientSignal::CallMute { .. })),
        1
    );

    b.controller.set_muted(false).await?;
    assert_eq!(b.backend.stats().capture_enabled, Some(true));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_joiner_sees_the_running_call() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");
    a.controller.start_call().await?;
    until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    b.controller.accept_call().await?;
    until(&a, "a linked", |s| s.remote_streams.len() == 1).await;

    let d = relay.join("d");
    let snapshot = until(&d, "ringing", |s| s.state == CallState::Ringing).await;
    assert_eq!(snapshot.host_label.as_deref(), Some("a"));
    assert_eq!(members(&snapshot), vec!["a", "b"]);

    d.controller.accept_call().await?;
    let snapshot = until(&d, "d linked", |s| s.remote_streams.len() == 2).await;
    assert_eq!(streams_from(&snapshot), vec!["a", "b"]);
    assert_eq!(relay.offers(&d.id, &a.id), 1);
    assert_eq!(relay.offers(&d.id, &b.id), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trailing_offer_after_the_call_is_dropped() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");
    a.controller.start_call().await?;
    until(&b, "ringing", |s| s.state == CallState::Ringing).await;
    a.controller.leave_call().await?;
    until(&b, "ended", |s| s.state == CallState::Ended).await;

    let created = b.backend.stats().connections_created;
    relay.inject(
        &b.id,
        RelaySignal::CallOffer {
            room_id: ROOM.into(),
            from: "ghost".into(),
            sdp: SessionDescription::offer("v=0"),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.backend.stats().connections_created, created);
    assert_eq!(
        relay.count_sent(|f, s| f == &b.id && matches!(s, ClientSignal::CallAnswer { .. })),
        0
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn offer_from_a_departed_peer_is_dropped() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let (a, b, _c) = three_party_call(&relay).await;

    a.controller.leave_call().await?;
    until(&b, "a gone", |s| s.participants.len() == 2 && s.remote_streams.len() == 1).await;
    let created = b.backend.stats().connections_created;

    relay.inject(
        &b.id,
        RelaySignal::CallOffer {
            room_id: ROOM.into(),
            from: a.id.clone(),
            sdp: SessionDescription::offer("v=0"),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = b.controller.snapshot().await?;
    assert_eq!(snapshot.state, CallState::InCall);
    assert_eq!(members(&snapshot), vec!["b", "c"]);
    assert_eq!(streams_from(&snapshot), vec!["c"]);
    assert_eq!(b.backend.stats().connections_created, created);
    assert_eq!(
        relay.count_sent(|f, s| {
            f == &b.id && matches!(s, ClientSignal::CallAnswer { to, .. } if to == &a.id)
        }),
        0
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_leaves_the_room_untouched() -> anyhow::Result<()> {
    let relay = FakeRelay::default();
    let a = relay.join("a");
    let b = relay.join("b");
    a.backend.fail_capture(true);

    assert!(a.controller.start_call().await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.controller.snapshot().await?.state, CallState::Idle);
    assert_eq!(relay.count_sent(|_, _| true), 0);
    Ok(())
}
