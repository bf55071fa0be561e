//! Session orchestrator
//!
//! Owns the whole pipeline and drives the tick loop: wait for a receiver,
//! negotiate the config, then capture -> encode -> send at the target frame
//! cadence while draining control messages and input events inline.

use anyhow::{Context, Result};
use slatecast_capture::{open_capture, Capture};
use slatecast_core::protocol::ConfigResponse;
use slatecast_core::ServerConfig;
use slatecast_encoder::VaapiEncoder;
use slatecast_input::InputRelay;
use slatecast_net::{
    AudioSender, ControlChannel, ControlEvent, ControlListener, InputListener, ReceiverDescriptor,
    VideoSender,
};
use slatecast_audio::AudioStreamer;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Session {
    config: ServerConfig,
    capture: Capture,
    encoder: VaapiEncoder,
    control: ControlListener,
    video: VideoSender,
    input: InputListener,
    relay: InputRelay,
    audio: Option<AudioStreamer>,
    running: Arc<AtomicBool>,
    frame_number: u16,
}

impl Session {
    /// Initialize every component. Audio and input-device failures degrade;
    /// everything else is fatal.
    pub fn new(config: ServerConfig, running: Arc<AtomicBool>) -> Result<Self> {
        let capture = open_capture(config.capture, &config.display)
            .context("failed to open a capture source")?;

        let encoder_config = config.encoder_config(capture.width(), capture.height());
        let encoder = VaapiEncoder::open(&encoder_config)
            .context("failed to open a hardware encoder")?;

        let control = ControlListener::bind(
            config.control_port,
            Path::new(&config.cert_file),
            Path::new(&config.key_file),
            config.ca_file.as_deref().map(Path::new),
        )
        .context("failed to bind the control port")?;

        let video = VideoSender::bind(config.video_port).context("failed to bind the video port")?;
        let input = InputListener::bind(config.input_port).context("failed to bind the input port")?;

        let relay = InputRelay::new(capture.width(), capture.height());

        let audio = if config.audio_enabled {
            match AudioSender::bind(config.audio_port)
                .map_err(anyhow::Error::from)
                .and_then(|sender| AudioStreamer::start(&config.audio, sender).map_err(Into::into))
            {
                Ok(streamer) => Some(streamer),
                Err(e) => {
                    warn!("Audio disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Server initialized: {}x{} @ {} fps, {} codec",
            capture.width(),
            capture.height(),
            config.fps,
            encoder.codec().name()
        );

        Ok(Self {
            config,
            capture,
            encoder,
            control,
            video,
            input,
            relay,
            audio,
            running,
            frame_number: 0,
        })
    }

    /// Outer loop: serve one receiver at a time until shutdown
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            info!("Waiting for receiver on port {}...", self.config.control_port);

            let Some(mut channel) = self.wait_for_receiver() else {
                break;
            };

            match self.negotiate(&mut channel) {
                Ok(_) => {
                    info!("Receiver connected, starting stream");
                    self.stream_loop(&mut channel);
                }
                Err(e) => {
                    warn!("Handshake failed: {}", e);
                }
            }

            // Session teardown: no stuck keys, no stale destinations
            self.relay.reset_all();
            self.input.reset();
            self.video.clear_destination();
            if let Some(audio) = &self.audio {
                audio.clear_destination();
            }

            if self.running.load(Ordering::SeqCst) {
                info!("Session ended, waiting for a new receiver");
            }
        }

        info!("Server stopped");
    }

    fn wait_for_receiver(&mut self) -> Option<ControlChannel> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            match self.control.try_accept() {
                Ok(Some(channel)) => return Some(channel),
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Handshake: read the ConfigRequest, wire up destinations, reply
    fn negotiate(&mut self, channel: &mut ControlChannel) -> Result<ReceiverDescriptor> {
        let descriptor = channel
            .wait_config_request(Duration::from_secs(5))
            .context("no config request")?;

        self.video
            .set_destination(descriptor.ip, descriptor.video_port, self.config.pacing);

        let audio_active = match (&self.audio, descriptor.audio_port) {
            (Some(audio), port) => {
                let port = if port != 0 { port } else { self.config.audio_port };
                audio.set_destination(descriptor.ip, port);
                true
            }
            (None, _) => false,
        };

        self.relay.configure(
            self.capture.width(),
            self.capture.height(),
            descriptor.width as u32,
            descriptor.height as u32,
        );

        channel.send_config(&ConfigResponse {
            screen_width: self.capture.width() as u16,
            screen_height: self.capture.height() as u16,
            video_port: self.config.video_port,
            input_port: self.config.input_port,
            audio_port: if audio_active { self.config.audio_port } else { 0 },
            audio_sample_rate: self.config.audio.sample_rate as u16,
            audio_channels: self.config.audio.channels,
            audio_frame_ms: self.config.audio.frame_ms,
            codec_id: self.encoder.codec().wire_id(),
        })?;

        Ok(descriptor)
    }

    /// Inner loop: one session's frame cadence
    fn stream_loop(&mut self, channel: &mut ControlChannel) {
        // A joining receiver cannot decode until it sees a keyframe
        self.frame_number = 0;
        self.encoder.request_keyframe();

        let frame_interval = Duration::from_micros(1_000_000 / self.config.fps.max(1) as u64);
        let mut next_frame = Instant::now();

        while self.running.load(Ordering::SeqCst) && channel.is_connected() {
            for event in channel.poll() {
                match event {
                    ControlEvent::KeyframeRequest => {
                        info!("Keyframe requested by receiver");
                        self.encoder.request_keyframe();
                    }
                    ControlEvent::Disconnect => break,
                }
            }
            if !channel.is_connected() {
                break;
            }

            for event in self.input.poll() {
                if let Err(e) = self.relay.dispatch(&event) {
                    debug!("Input dispatch failed: {}", e);
                }
            }

            let now = Instant::now();
            if now >= next_frame {
                self.tick();
                next_frame += frame_interval;

                // Never fall more than one interval behind; skip instead
                if next_frame < now {
                    next_frame = now + frame_interval;
                }
            }

            sleep_strategy(next_frame, self.config.fps);
        }
    }

    /// One capture/encode/send pass
    fn tick(&mut self) {
        let frame = match self.capture.capture() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!("Capture error: {}", e);
                return;
            }
        };

        let encoded = match self.encoder.encode(&frame) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return, // encoder is still warming up
            Err(e) => {
                debug!("Encode error: {}", e);
                return;
            }
        };

        match self.video.send_frame(&encoded, self.frame_number) {
            Ok(sent) => {
                if sent {
                    if encoded.is_keyframe || self.frame_number % 60 == 0 {
                        debug!(
                            "Frame {}: {} bytes, keyframe={}",
                            self.frame_number,
                            encoded.data.len(),
                            encoded.is_keyframe
                        );
                    }
                    self.frame_number = self.frame_number.wrapping_add(1);
                }
            }
            Err(e) => debug!("Send error: {}", e),
        }
    }
}

/// Sleep toward the next deadline without giving up tick accuracy.
///
/// Above 90 fps the schedule tightens: sleep only 60% of the remaining time
/// and busy-wait the last 500 us. The sleep is capped so control and input
/// stay responsive even at 1 fps.
fn sleep_strategy(deadline: Instant, fps: u32) {
    let now = Instant::now();
    let Some(remaining) = deadline.checked_duration_since(now) else {
        return;
    };

    if fps > 90 {
        if remaining > Duration::from_micros(500) {
            std::thread::sleep((remaining * 6 / 10).min(Duration::from_millis(50)));
        }
        // Below 500 us: busy-wait, the loop spins back around
        return;
    }

    if remaining > Duration::from_millis(1) {
        std::thread::sleep((remaining / 2).min(Duration::from_millis(50)));
    } else if remaining > Duration::from_micros(100) {
        std::thread::sleep(Duration::from_micros(50));
    }
    // Below 100 us: busy-wait
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deadline catch-up logic from the stream loop, isolated
    fn advance(next_frame: Instant, now: Instant, interval: Duration) -> Instant {
        let mut next = next_frame + interval;
        if next < now {
            next = now + interval;
        }
        next
    }

    #[test]
    fn on_time_ticks_advance_by_one_interval() {
        let interval = Duration::from_millis(16);
        let start = Instant::now();
        let next = advance(start, start, interval);
        assert_eq!(next, start + interval);
    }

    #[test]
    fn late_ticks_reset_to_now_plus_interval() {
        let interval = Duration::from_millis(16);
        let start = Instant::now();
        // We are three intervals late
        let now = start + interval * 3;
        let next = advance(start, now, interval);
        assert_eq!(next, now + interval);
    }

    #[test]
    fn sleep_strategy_returns_quickly_when_deadline_passed() {
        let begin = Instant::now();
        sleep_strategy(begin - Duration::from_millis(5), 60);
        assert!(begin.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn sleep_is_capped_for_low_frame_rates() {
        // At 1 fps the remaining time is ~1 s; input must still be drained
        // well inside 100 ms
        let begin = Instant::now();
        sleep_strategy(begin + Duration::from_secs(1), 1);
        assert!(begin.elapsed() < Duration::from_millis(100));
    }
}
