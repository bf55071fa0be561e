//! SlateCast Audio - system output capture and Opus streaming
//!
//! A PipeWire stream captures the default output monitor as interleaved
//! f32 at 48 kHz stereo. Samples accumulate until one Opus frame is
//! available, then encode-and-send runs under a single lock so the capture
//! callback thread never races the orchestrator. Audio is optional: any
//! setup failure disables it for the lifetime of the process.

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate, Signal};
use pipewire as pw;
use pw::spa;
use slatecast_core::{AudioConfig, Error, Result};
use slatecast_net::AudioSender;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Maximum encoded Opus packet is 1275 bytes; leave headroom
const ENCODE_BUFFER_BYTES: usize = 4000;

struct AudioInner {
    encoder: OpusEncoder,
    sender: AudioSender,
    pending: Vec<f32>,
    encode_buf: Vec<u8>,
    /// Interleaved samples per Opus frame
    samples_per_frame: usize,
    /// Samples per channel per Opus frame
    frame_samples: u32,
    sequence: u16,
    /// In 48 kHz sample units, wraps
    timestamp: u32,
}

impl AudioInner {
    /// Append captured samples and flush every complete Opus frame
    fn push_samples(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.samples_per_frame {
            let frame = &self.pending[..self.samples_per_frame];
            match self.encoder.encode_float(frame, &mut self.encode_buf) {
                Ok(len) => {
                    let payload = &self.encode_buf[..len];
                    let sequence = self.sequence;
                    let timestamp = self.timestamp;
                    if let Err(e) = self.sender.send_packet(payload, sequence, timestamp) {
                        debug!("Audio send failed: {}", e);
                    }
                }
                Err(e) => debug!("Opus encode failed: {:?}", e),
            }
            self.sequence = self.sequence.wrapping_add(1);
            self.timestamp = self.timestamp.wrapping_add(self.frame_samples);
            self.pending.drain(..self.samples_per_frame);
        }
    }
}

struct Shared {
    inner: Mutex<AudioInner>,
    running: AtomicBool,
    channels: u8,
    sample_rate: u32,
}

/// Owns the capture thread and the Opus encoder state
pub struct AudioStreamer {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioStreamer {
    /// Set up the encoder and start the capture thread. Any failure here
    /// means the server runs without audio.
    pub fn start(config: &AudioConfig, sender: AudioSender) -> Result<Self> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(Error::Audio(format!("unsupported channel count {}", other))),
        };
        let sample_rate = match config.sample_rate {
            48_000 => SampleRate::Hz48000,
            other => return Err(Error::Audio(format!("unsupported sample rate {}", other))),
        };

        let mut encoder = OpusEncoder::new(sample_rate, channels, Application::Audio)
            .map_err(|e| Error::Audio(format!("opus encoder: {:?}", e)))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.bitrate as i32))
            .map_err(|e| Error::Audio(format!("opus bitrate: {:?}", e)))?;
        encoder
            .set_complexity(5)
            .map_err(|e| Error::Audio(format!("opus complexity: {:?}", e)))?;
        encoder
            .set_signal(Signal::Music)
            .map_err(|e| Error::Audio(format!("opus signal: {:?}", e)))?;
        encoder
            .set_inband_fec(false)
            .map_err(|e| Error::Audio(format!("opus fec: {:?}", e)))?;

        let frame_samples = config.frame_samples();
        let inner = AudioInner {
            encoder,
            sender,
            pending: Vec::with_capacity(frame_samples * config.channels as usize * 4),
            encode_buf: vec![0u8; ENCODE_BUFFER_BYTES],
            samples_per_frame: frame_samples * config.channels as usize,
            frame_samples: frame_samples as u32,
            sequence: 0,
            timestamp: 0,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(inner),
            running: AtomicBool::new(true),
            channels: config.channels,
            sample_rate: config.sample_rate,
        });

        let thread_shared = shared.clone();
        let thread = std::thread::spawn(move || {
            if let Err(e) = run_capture(thread_shared.clone()) {
                error!("Audio capture thread error: {}", e);
            }
            thread_shared.running.store(false, Ordering::SeqCst);
        });

        // Give the stream a moment to fail fast on systems without PipeWire
        std::thread::sleep(Duration::from_millis(200));
        if !shared.running.load(Ordering::SeqCst) {
            return Err(Error::Audio("audio capture failed to start".into()));
        }

        info!(
            "Audio streaming: {} Hz, {} ch, {} kbps, {} ms frames",
            config.sample_rate,
            config.channels,
            config.bitrate / 1000,
            config.frame_ms
        );

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Point the audio stream at a connected receiver
    pub fn set_destination(&self, ip: IpAddr, port: u16) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.sender.set_destination(ip, port);
            inner.pending.clear();
            inner.timestamp = 0;
        }
    }

    pub fn clear_destination(&self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.sender.clear_destination();
        }
    }
}

impl Drop for AudioStreamer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// PipeWire capture loop on its own thread
fn run_capture(shared: Arc<Shared>) -> std::result::Result<(), Box<dyn std::error::Error>> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None)?;
    let context = pw::context::Context::new(&mainloop)?;
    let core = context.connect(None)?;

    let stream = pw::stream::Stream::new(
        &core,
        "slatecast-audio",
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Music",
            // Capture what the default sink is playing, not a microphone
            "stream.capture.sink" => "true",
        },
    )?;

    let channels = shared.channels as usize;
    let process_shared = shared.clone();
    let _listener = stream
        .add_local_listener_with_user_data(())
        .state_changed(|_, _, old, new| {
            debug!("Audio stream state: {:?} -> {:?}", old, new);
        })
        .process(move |stream, _| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let chunk = datas[0].chunk();
            let offset = chunk.offset() as usize;
            let size = chunk.size() as usize;
            let Some(slice) = datas[0].data() else { return };
            if size == 0 || offset + size > slice.len() {
                return;
            }

            let bytes = &slice[offset..offset + size];
            let sample_count = size / 4;
            if sample_count == 0 || sample_count % channels != 0 {
                return;
            }

            let mut samples = Vec::with_capacity(sample_count);
            for quad in bytes.chunks_exact(4) {
                samples.push(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
            }

            if let Ok(mut inner) = process_shared.inner.lock() {
                inner.push_samples(&samples);
            }
        })
        .register()?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(shared.sample_rate);
    audio_info.set_channels(shared.channels as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };
    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("failed to build audio format pod: {:?}", e))?
    .0
    .into_inner();
    let mut params = [spa::pod::Pod::from_bytes(&values).ok_or("invalid audio format pod")?];

    stream.connect(
        spa::utils::Direction::Input,
        None,
        pw::stream::StreamFlags::AUTOCONNECT
            | pw::stream::StreamFlags::MAP_BUFFERS
            | pw::stream::StreamFlags::RT_PROCESS,
        &mut params,
    )?;

    info!("Audio capture connected to output monitor");

    while shared.running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(Duration::from_millis(20));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn test_inner(frame_ms: u8) -> (AudioInner, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let config = AudioConfig {
            frame_ms,
            ..AudioConfig::default()
        };
        let mut sender = AudioSender::bind(0).unwrap();
        sender.set_destination(
            "127.0.0.1".parse().unwrap(),
            receiver.local_addr().unwrap().port(),
        );

        let encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .unwrap();
        let frame_samples = config.frame_samples();
        let inner = AudioInner {
            encoder,
            sender,
            pending: Vec::new(),
            encode_buf: vec![0u8; ENCODE_BUFFER_BYTES],
            samples_per_frame: frame_samples * 2,
            frame_samples: frame_samples as u32,
            sequence: 0,
            timestamp: 0,
        };
        (inner, receiver)
    }

    #[test]
    fn a_full_frame_produces_one_datagram() {
        let (mut inner, receiver) = test_inner(10);

        // 10 ms of stereo silence at 48 kHz = 960 interleaved samples
        inner.push_samples(&vec![0.0f32; 960]);

        let mut buf = [0u8; 2048];
        let n = receiver.recv(&mut buf).unwrap();
        let header = slatecast_core::protocol::AudioPacketHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.sequence, 0);
        assert_eq!(header.timestamp, 0);
        assert_eq!(n, slatecast_core::protocol::AudioPacketHeader::SIZE + header.payload_len as usize);
        assert!(header.payload_len > 0);
    }

    #[test]
    fn partial_frames_accumulate_without_sending() {
        let (mut inner, receiver) = test_inner(10);
        receiver
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        inner.push_samples(&vec![0.0f32; 500]);
        assert!(receiver.recv(&mut [0u8; 64]).is_err());
        assert_eq!(inner.pending.len(), 500);
    }

    #[test]
    fn timestamp_advances_in_sample_units() {
        let (mut inner, receiver) = test_inner(10);

        // Two full frames at once
        inner.push_samples(&vec![0.0f32; 1920]);

        let mut buf = [0u8; 2048];
        let n = receiver.recv(&mut buf).unwrap();
        let first = slatecast_core::protocol::AudioPacketHeader::parse(&buf[..n]).unwrap();
        let n = receiver.recv(&mut buf).unwrap();
        let second = slatecast_core::protocol::AudioPacketHeader::parse(&buf[..n]).unwrap();

        assert_eq!(first.timestamp, 0);
        assert_eq!(second.timestamp, 480);
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));
    }
}
