//! Playback of one remote audio track on the default output device.
//!
//! A receiver task turns RTP packets into opus samples. A playback thread owns the cpal output
//! stream, decodes the samples and fills the ring buffer the output callback reads from.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use huddle::PeerId;
use ringbuf::HeapRb;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Notify,
};
use webrtc::{
    media::{io::sample_builder::SampleBuilder, Sample},
    track::track_remote::TrackRemote,
    util::Unmarshal,
};

use crate::{FRAME_SAMPLES, SAMPLE_RATE};

pub struct Playback {
    stream_id: String,
    quit_thread: Arc<AtomicBool>,
    quit_receiver_task: Arc<Notify>,
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.quit_thread.store(true, Ordering::Relaxed);
        self.quit_receiver_task.notify_waiters();
    }
}

impl Playback {
    pub fn start(peer_id: PeerId, track: Arc<TrackRemote>, stream_id: String) -> Self {
        let quit_thread = Arc::new(AtomicBool::new(false));
        let quit_receiver_task = Arc::new(Notify::new());

        let (packet_tx, packet_rx) = mpsc::unbounded_channel::<Sample>();

        let should_quit = quit_thread.clone();
        let thread_peer = peer_id.clone();
        std::thread::spawn(move || {
            if let Err(e) = play(packet_rx, should_quit) {
                log::error!("playback for peer {thread_peer} stopped: {e}");
            }
        });

        let should_quit = quit_receiver_task.clone();
        tokio::spawn(async move {
            receive(track, peer_id, packet_tx, should_quit).await;
        });

        Self {
            stream_id,
            quit_thread,
            quit_receiver_task,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

async fn receive(
    track: Arc<TrackRemote>,
    peer_id: PeerId,
    packet_tx: UnboundedSender<Sample>,
    should_quit: Arc<Notify>,
) {
    let mut b = [0u8; 2880 * 4];
    let mut log_decode_error_once = false;
    let mut sample_builder = {
        let max_late = 512;
        let depacketizer = webrtc::rtp::codecs::opus::OpusPacket;
        SampleBuilder::new(max_late, depacketizer, SAMPLE_RATE)
    };

    loop {
        let (siz, _attr) = tokio::select! {
            x = track.read(&mut b) => match x {
                Ok(y) => y,
                Err(e) => {
                    log::debug!("audio receiver task for peer {peer_id} terminated by error: {e}");
                    break;
                }
            },
            _ = should_quit.notified() => {
                log::debug!("audio receiver task for peer {peer_id} terminated by notify");
                break;
            }
        };

        let mut buf = &b[..siz];
        let rtp_packet = match webrtc::rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(r) => r,
            Err(e) => {
                if !log_decode_error_once {
                    log_decode_error_once = true;
                    log::error!("unmarshall rtp packet failed for peer {peer_id}: {}", e);
                }
                continue;
            }
        };

        sample_builder.push(rtp_packet);
        while let Some(sample) = sample_builder.pop() {
            if packet_tx.send(sample).is_err() {
                return;
            }
        }
    }
}

fn play(
    mut packet_rx: UnboundedReceiver<Sample>,
    should_quit: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device"))?;
    let num_channels = (device.default_output_config()?.channels() as usize).max(1);

    // one second of audio at most
    let rb = HeapRb::<f32>::new(SAMPLE_RATE as usize * num_channels);
    let (mut producer, mut consumer) = rb.split();

    let config = cpal::StreamConfig {
        channels: num_channels as _,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        for sample in data.iter_mut() {
            *sample = consumer.pop().unwrap_or(0.0);
        }
    };
    let stream = device.build_output_stream(
        &config,
        output_data_fn,
        |err| log::error!("an error occurred on the output stream: {}", err),
        None,
    )?;
    stream.play()?;

    let mut decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?;
    // opus frames are at most 120ms
    let mut decoder_output_buf = vec![0_f32; FRAME_SAMPLES * 12];
    while !should_quit.load(Ordering::Relaxed) {
        let sample = match packet_rx.try_recv() {
            Ok(sample) => sample,
            Err(mpsc::error::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        };

        match decoder.decode_float(sample.data.as_ref(), &mut decoder_output_buf, false) {
            Ok(size) => {
                for val in decoder_output_buf.iter().take(size) {
                    for _ in 0..num_channels {
                        let _ = producer.push(*val);
                    }
                }
            }
            Err(e) => {
                log::error!("decode error: {e}");
            }
        }
    }

    let _ = stream.pause();
    Ok(())
}
