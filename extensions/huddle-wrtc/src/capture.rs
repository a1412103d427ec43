//! Microphone capture feeding one opus track shared by every peer connection.
//!
//! cpal streams can't leave the thread that built them, so the input stream lives on its own
//! thread. Samples travel through a ring buffer to an encoder thread, and encoded frames go to a
//! tokio task that writes them to the track.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BuildStreamError,
};
use huddle::error::Error;
use ringbuf::{HeapRb, Producer};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Notify,
};
use webrtc::{media::Sample, track::track_local::track_local_static_sample::TrackLocalStaticSample};

use crate::{FRAME_SAMPLES, SAMPLE_RATE};

type AudioProducer = Producer<f32, Arc<HeapRb<f32>>>;

pub struct SourceTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    quit_threads: Arc<AtomicBool>,
    quit_sender_task: Arc<Notify>,
}

impl Drop for SourceTrack {
    fn drop(&mut self) {
        self.quit_threads.store(true, Ordering::Relaxed);
        self.quit_sender_task.notify_waiters();
    }
}

impl SourceTrack {
    /// opens the default input device. the capture starts enabled
    pub fn start(track: Arc<TrackLocalStaticSample>) -> Result<Self, Error> {
        let enabled = Arc::new(AtomicBool::new(true));
        let quit_threads = Arc::new(AtomicBool::new(false));
        let quit_sender_task = Arc::new(Notify::new());

        // 20 seconds of mono audio
        let rb = HeapRb::<f32>::new(SAMPLE_RATE as usize * 20);
        let (producer, mut consumer) = rb.split();

        // the input thread reports whether the stream could be built before parking
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), Error>>();
        let should_quit = quit_threads.clone();
        let is_enabled = enabled.clone();
        std::thread::spawn(move || {
            let stream = match open_input_stream(is_enabled, producer) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(Error::MediaUnavailable(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            while !should_quit.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            log::debug!("microphone stream closed");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::MediaUnavailable(
                    "input thread exited before opening the microphone".into(),
                ))
            }
        }

        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| Error::MediaUnavailable(e.to_string()))?;
        // everything below runs until the capture is dropped
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let should_quit = quit_threads.clone();
        std::thread::spawn(move || {
            let mut buf: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES);
            let mut opus_out = vec![0_u8; FRAME_SAMPLES * 4];
            while !should_quit.load(Ordering::Relaxed) {
                while let Some(sample) = consumer.pop() {
                    buf.push(sample);
                    if buf.len() == FRAME_SAMPLES {
                        break;
                    }
                }
                if buf.len() < FRAME_SAMPLES {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                encode_frame(&mut encoder, &buf, &mut opus_out, &frame_tx);
                buf.clear();
            }
        });

        let sender_track = track.clone();
        let notify = quit_sender_task.clone();
        tokio::spawn(async move {
            send_frames(sender_track, frame_rx, notify).await;
        });

        Ok(Self {
            track,
            enabled,
            quit_threads,
            quit_sender_task,
        })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// a disabled capture drops samples at the device. the track and its senders stay untouched
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

fn open_input_stream(
    enabled: Arc<AtomicBool>,
    mut producer: AudioProducer,
) -> Result<cpal::Stream, Error> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaUnavailable("no input device".into()))?;
    let num_channels = device
        .default_input_config()
        .map(|c| c.channels() as usize)
        .map_err(|e| Error::MediaUnavailable(e.to_string()))?
        .max(1);

    let config = cpal::StreamConfig {
        channels: num_channels as _,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        if !enabled.load(Ordering::Relaxed) {
            return;
        }
        // merge channels
        if num_channels != 1 {
            for frame in data.chunks_exact(num_channels) {
                let _ = producer.push(frame.iter().sum::<f32>() / num_channels as f32);
            }
        } else {
            for sample in data {
                let _ = producer.push(*sample);
            }
        }
    };

    device
        .build_input_stream(
            &config,
            input_data_fn,
            |err| log::error!("an error occurred on the input stream: {}", err),
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::StreamConfigNotSupported => {
                Error::MediaUnavailable("input device doesn't support 48kHz".into())
            }
            BuildStreamError::DeviceNotAvailable => {
                Error::MediaUnavailable("input device not available".into())
            }
            e => Error::MediaUnavailable(format!("failed to build input stream: {e}")),
        })
}

fn encode_frame(
    encoder: &mut opus::Encoder,
    frame: &[f32],
    opus_out: &mut [u8],
    tx: &UnboundedSender<bytes::Bytes>,
) {
    match encoder.encode_float(frame, opus_out) {
        Ok(size) => {
            let _ = tx.send(bytes::Bytes::copy_from_slice(&opus_out[..size]));
        }
        Err(e) => {
            log::error!("opus encoder failed: {}", e);
        }
    }
}

async fn send_frames(
    track: Arc<TrackLocalStaticSample>,
    mut rx: UnboundedReceiver<bytes::Bytes>,
    should_quit: Arc<Notify>,
) {
    let duration = Duration::from_millis(1000 * FRAME_SAMPLES as u64 / SAMPLE_RATE as u64);
    loop {
        let data = tokio::select! {
            _ = should_quit.notified() => {
                log::debug!("capture sender task terminated via notify");
                break;
            }
            opt = rx.recv() => match opt {
                Some(data) => data,
                None => {
                    log::debug!("capture sender task terminated: channel closed");
                    break;
                }
            }
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            log::error!("failed to write audio sample: {}", e);
        }
    }
}
