//! huddle-wrtc
//! A [`MediaBackend`] built on [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! Each remote participant gets one `RTCPeerConnection`. The microphone is captured once per call
//! with cpal, encoded with opus and written to a single local track that every connection
//! sends. Remote tracks are decoded and played on the default output device.
//!
//! Muting never touches the track: the capture simply stops feeding samples, so no connection
//! has to renegotiate.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use huddle::{
    config::Config,
    error::{Error, Result},
    media::{ConnectionState, LinkObserver, MediaBackend},
    signaling::{IceCandidate, SdpType, SessionDescription},
    PeerId,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

mod capture;
mod sink;

use capture::SourceTrack;
use sink::Playback;

pub(crate) const SAMPLE_RATE: u32 = 48000;
/// 10ms at 48kHz
pub(crate) const FRAME_SAMPLES: usize = 480;

pub struct WrtcBackend {
    api: API,
    ice_servers: Vec<String>,
}

pub struct Capture {
    source: SourceTrack,
}

pub struct Connection {
    peer: PeerId,
    connection: Arc<RTCPeerConnection>,
    playback: Arc<Mutex<Vec<Playback>>>,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
}

impl WrtcBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let api = create_api()?;
        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaBackend for WrtcBackend {
    type Capture = Capture;
    type Connection = Connection;

    async fn acquire_capture(&self) -> Result<Capture> {
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".into(),
            Uuid::new_v4().to_string(),
        ));
        let source = SourceTrack::start(track)?;
        Ok(Capture { source })
    }

    fn set_capture_enabled(&self, capture: &Capture, enabled: bool) {
        capture.source.set_enabled(enabled);
        log::debug!("microphone enabled: {}", capture.source.is_enabled());
    }

    async fn release_capture(&self, capture: Capture) {
        // dropping the source stops the capture threads and the sender task
        drop(capture);
    }

    async fn create_connection(
        &self,
        peer: &PeerId,
        observer: LinkObserver,
    ) -> Result<Connection> {
        let connection = self
            .api
            .new_peer_connection(self.rtc_config())
            .await
            .map_err(|e| Error::negotiation(peer, e))?;
        let connection = Arc::new(connection);
        let playback: Arc<Mutex<Vec<Playback>>> = Arc::new(Mutex::new(vec![]));

        let obs = observer.clone();
        connection.on_peer_connection_state_change(Box::new(move |c: RTCPeerConnectionState| {
            log::info!(
                "WebRTC connection state for peer {} has changed {}",
                obs.peer(),
                c
            );
            if let Some(state) = connection_state(c) {
                obs.connection_state(state);
            }
            Box::pin(futures::future::ready(()))
        }));

        let obs = observer.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => obs.ice_candidate(ice_candidate(init)),
                    Err(e) => {
                        log::error!("failed to serialize ice candidate for {}: {e}", obs.peer())
                    }
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let obs = observer;
        let sinks = playback.clone();
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                // only audio is negotiated
                if let Some(track) = track {
                    let stream_id = Uuid::new_v4().to_string();
                    let sink = Playback::start(obs.peer().clone(), track, stream_id.clone());
                    sinks.lock().push(sink);
                    obs.track_added(stream_id);
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        Ok(Connection {
            peer: peer.clone(),
            connection,
            playback,
            rtcp_readers: Mutex::new(vec![]),
        })
    }

    async fn add_track(&self, connection: &Connection, capture: &Capture) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = capture.source.track();
        let rtp_sender = connection
            .connection
            .add_track(track)
            .await
            .map_err(|e| Error::negotiation(&connection.peer, e))?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            log::debug!("terminating rtp_sender reader");
        });
        connection.rtcp_readers.lock().push(handle);
        Ok(())
    }

    async fn create_offer(&self, connection: &Connection) -> Result<SessionDescription> {
        let pc = &connection.connection;
        let negotiation = |e: webrtc::Error| Error::negotiation(&connection.peer, e);
        let offer = pc.create_offer(None).await.map_err(negotiation)?;
        // Note: this will start the gathering of ICE candidates
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, connection: &Connection) -> Result<SessionDescription> {
        let pc = &connection.connection;
        let negotiation = |e: webrtc::Error| Error::negotiation(&connection.peer, e);
        let answer = pc.create_answer(None).await.map_err(negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        connection: &Connection,
        sdp: SessionDescription,
    ) -> Result<()> {
        let desc =
            rtc_description(sdp).map_err(|e| Error::negotiation(&connection.peer, e))?;
        connection
            .connection
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::negotiation(&connection.peer, e))
    }

    async fn add_ice_candidate(
        &self,
        connection: &Connection,
        candidate: IceCandidate,
    ) -> Result<()> {
        connection
            .connection
            .add_ice_candidate(ice_candidate_init(candidate))
            .await
            .map_err(|e| Error::negotiation(&connection.peer, e))
    }

    async fn close(&self, connection: Connection) {
        for handle in connection.rtcp_readers.lock().drain(..) {
            handle.abort();
        }
        for sink in connection.playback.lock().drain(..) {
            log::debug!("stopping playback of {} for {}", sink.stream_id(), connection.peer);
        }
        if let Err(e) = connection.connection.close().await {
            log::error!("failed to close peer connection: {e}");
        }
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: SAMPLE_RATE,
        channels: 1,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

// mono opus only. browsers offer 48kHz stereo opus as payload type 111 and accept mono in it
fn create_api() -> anyhow::Result<API> {
    let mut media = MediaEngine::default();

    media.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features. If you use `webrtc.NewPeerConnection`
    // this is enabled by default. If you are manually managing You MUST create a InterceptorRegistry
    // for each PeerConnection.
    let mut registry = Registry::new();

    // Use the default set of Interceptors
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
    }
}

fn rtc_description(sdp: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let desc = match sdp.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp.sdp)?,
        SdpType::Rollback => bail!("rollback is not supported"),
    };
    Ok(desc)
}

fn ice_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn ice_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}
