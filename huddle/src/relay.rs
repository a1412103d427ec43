//! In-process plumbing between the call controller and whatever carries frames to the relay.
//!
//! The controller only sees channels. A transport (a websocket pump, or a test harness standing in
//! for the relay) holds the other end: it drains [`RelayEndpoint::outgoing`] and feeds decoded
//! frames into [`RelayEndpoint::incoming`].

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    error::{Error, Result},
    signaling::{ClientSignal, RelaySignal},
};

#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: UnboundedSender<ClientSignal>,
}

impl RelayHandle {
    pub fn send(&self, signal: ClientSignal) -> Result<()> {
        log::trace!("sending {signal}");
        self.tx
            .send(signal)
            .map_err(|e| Error::FailedToSendSignal(e.to_string()))
    }
}

/// the half handed to the call controller
pub struct RelayClient {
    pub handle: RelayHandle,
    pub incoming: UnboundedReceiver<RelaySignal>,
}

/// the half pumped by the transport
pub struct RelayEndpoint {
    pub outgoing: UnboundedReceiver<ClientSignal>,
    pub incoming: UnboundedSender<RelaySignal>,
}

pub fn pair() -> (RelayClient, RelayEndpoint) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        RelayClient {
            handle: RelayHandle { tx: out_tx },
            incoming: in_rx,
        },
        RelayEndpoint {
            outgoing: out_rx,
            incoming: in_tx,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn send_fails_once_transport_is_gone() -> anyhow::Result<()> {
        let (client, mut endpoint) = pair();
        client.handle.send(ClientSignal::CallLeave {
            room_id: "R".into(),
        })?;
        assert!(matches!(
            endpoint.outgoing.recv().await,
            Some(ClientSignal::CallLeave { .. })
        ));

        drop(endpoint);
        let r = client.handle.send(ClientSignal::CallLeave {
            room_id: "R".into(),
        });
        assert!(matches!(r, Err(Error::FailedToSendSignal(_))));
        Ok(())
    }
}
