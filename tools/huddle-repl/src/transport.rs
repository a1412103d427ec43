//! Pumps signaling frames between a websocket relay and the call controller.

use futures::{SinkExt, StreamExt};
use huddle::{
    relay::RelayEndpoint,
    signaling::{ClientSignal, RelaySignal},
    PeerId, RoomId,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// room membership frames. the call controller never sends these
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RoomFrame {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        username: String,
    },
}

/// `None` for frames that aren't call events, e.g. chat traffic in the same room
pub fn decode_frame(text: &str) -> Option<RelaySignal> {
    match serde_json::from_str::<RelaySignal>(text) {
        Ok(signal) => Some(signal),
        Err(e) => {
            log::debug!("ignoring relay frame: {e}");
            None
        }
    }
}

/// joins the room, then pumps frames until either side goes away
pub async fn connect(
    url: &str,
    join: RoomFrame,
    endpoint: RelayEndpoint,
) -> anyhow::Result<JoinHandle<()>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();
    sink.send(Message::text(serde_json::to_string(&join)?))
        .await?;

    let RelayEndpoint {
        mut outgoing,
        incoming,
    } = endpoint;

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                opt = outgoing.recv() => {
                    let signal: ClientSignal = match opt {
                        Some(r) => r,
                        None => {
                            log::debug!("relay pump terminated: controller stopped");
                            break;
                        }
                    };
                    let text = match serde_json::to_string(&signal) {
                        Ok(r) => r,
                        Err(e) => {
                            log::error!("failed to serialize {signal}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(text)).await {
                        log::error!("failed to send {signal}: {e}");
                        break;
                    }
                }
                opt = stream.next() => match opt {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(signal) = decode_frame(text.as_str()) {
                            if incoming.send(signal).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("relay connection failed: {e}");
                        break;
                    }
                }
            }
        }
    });

    Ok(handle)
}
