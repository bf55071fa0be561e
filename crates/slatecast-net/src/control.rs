//! TCP control channel: handshake, keyframe requests and liveness
//!
//! Exactly one receiver is served at a time. Messages are length-prefixed
//! (`[len(2, big-endian) | type(1) | payload]`); the channel socket runs
//! nonblocking and complete messages are parsed out of an accumulator so
//! the tick loop never stalls on a slow peer.

use crate::tls::{load_server_config, ControlStream};
use slatecast_core::protocol::{
    encode_control_message, ConfigRequest, ConfigResponse, MSG_CONFIG_REQUEST, MSG_CONFIG_RESPONSE,
    MSG_DISCONNECT, MSG_KEYFRAME_REQUEST, MSG_PING, MSG_PONG,
};
use slatecast_core::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the receiver told us during the handshake
#[derive(Debug, Clone)]
pub struct ReceiverDescriptor {
    pub ip: IpAddr,
    /// Advertised display size, used for the input coordinate transform
    pub width: u16,
    pub height: u16,
    /// UDP port the receiver listens on for video
    pub video_port: u16,
    /// UDP port for audio; 0 when the receiver did not ask for audio
    pub audio_port: u16,
}

/// Events surfaced from the runtime message drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    KeyframeRequest,
    Disconnect,
}

/// Listening side of the control channel
pub struct ControlListener {
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl ControlListener {
    /// Bind the control port. TLS is attempted when certificate paths are
    /// given; failure to initialize TLS falls back to plain TCP.
    pub fn bind(port: u16, cert_file: &Path, key_file: &Path, ca_file: Option<&Path>) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let tls = match load_server_config(cert_file, key_file, ca_file) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("TLS init failed ({}), falling back to plain TCP", e);
                None
            }
        };

        info!(
            "Control server listening on port {} ({})",
            port,
            if tls.is_some() { "TLS" } else { "no TLS" }
        );

        Ok(Self { listener, tls })
    }

    /// Nonblocking accept. Returns a connected channel once a receiver
    /// shows up.
    pub fn try_accept(&mut self) -> Result<Option<ControlChannel>> {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        info!("Receiver connected from {}", peer);
        stream.set_nodelay(true)?;

        let stream = match &self.tls {
            Some(config) => ControlStream::accept_tls(config.clone(), stream)?,
            None => ControlStream::Plain(stream),
        };
        // The handshake itself happens lazily on first read/write
        stream.set_nonblocking(true)?;

        Ok(Some(ControlChannel {
            stream,
            peer,
            buf: Vec::new(),
            connected: true,
        }))
    }
}

/// One connected receiver
pub struct ControlChannel {
    stream: ControlStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    connected: bool,
}

impl ControlChannel {
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Wait for the receiver's ConfigRequest, bounded by `timeout`
    pub fn wait_config_request(&mut self, timeout: Duration) -> Result<ReceiverDescriptor> {
        let deadline = Instant::now() + timeout;
        loop {
            for (msg_type, payload) in self.drain_messages()? {
                if msg_type == MSG_CONFIG_REQUEST {
                    let request = ConfigRequest::parse(&payload)?;
                    info!(
                        "Receiver config: {}x{}, video port {}",
                        request.width, request.height, request.video_port
                    );
                    return Ok(ReceiverDescriptor {
                        ip: self.peer.ip(),
                        width: request.width,
                        height: request.height,
                        video_port: request.video_port,
                        audio_port: request.audio_port,
                    });
                }
                debug!("Ignoring message 0x{:02x} before handshake", msg_type);
            }
            if !self.connected {
                return Err(Error::Control("receiver dropped during handshake".into()));
            }
            if Instant::now() > deadline {
                return Err(Error::Control("timed out waiting for config request".into()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send the ConfigResponse; streaming begins after this
    pub fn send_config(&mut self, response: &ConfigResponse) -> Result<()> {
        let mut payload = Vec::with_capacity(ConfigResponse::SIZE);
        response.write(&mut payload);
        self.send_message(MSG_CONFIG_RESPONSE, &payload)
    }

    /// Drain pending control messages, answering pings inline
    pub fn poll(&mut self) -> Vec<ControlEvent> {
        let mut events = Vec::new();

        let messages = match self.drain_messages() {
            Ok(messages) => messages,
            Err(e) => {
                debug!("Control read error: {}", e);
                self.connected = false;
                events.push(ControlEvent::Disconnect);
                return events;
            }
        };

        for (msg_type, payload) in messages {
            match msg_type {
                MSG_KEYFRAME_REQUEST => events.push(ControlEvent::KeyframeRequest),
                MSG_PING => {
                    if let Err(e) = self.send_message(MSG_PONG, &payload) {
                        debug!("Pong failed: {}", e);
                        self.connected = false;
                    }
                }
                MSG_DISCONNECT => {
                    info!("Receiver sent disconnect");
                    self.connected = false;
                }
                other => debug!("Ignoring control message 0x{:02x}", other),
            }
        }

        if !self.connected && !events.contains(&ControlEvent::Disconnect) {
            events.push(ControlEvent::Disconnect);
        }
        events
    }

    /// Read whatever is available and split out complete messages
    fn drain_messages(&mut self) -> Result<Vec<(u8, Vec<u8>)>> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("Receiver closed the control connection");
                    self.connected = false;
                    break;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e.into());
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            if self.buf.len() < 3 {
                break;
            }
            let length = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if length == 0 {
                // A zero length can never frame a type byte; drop it
                debug!("Discarding zero-length control frame");
                self.buf.drain(..2);
                continue;
            }
            if self.buf.len() < 2 + length {
                break;
            }
            let msg_type = self.buf[2];
            let payload = self.buf[3..2 + length].to_vec();
            self.buf.drain(..2 + length);
            messages.push((msg_type, payload));
        }
        Ok(messages)
    }

    /// Write a whole message, riding out WouldBlock on the tiny payloads
    /// this protocol uses
    fn send_message(&mut self, msg_type: u8, payload: &[u8]) -> Result<()> {
        let message = encode_control_message(msg_type, payload);
        let mut written = 0;
        let deadline = Instant::now() + Duration::from_secs(1);
        while written < message.len() {
            match self.stream.write(&message[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(Error::Control("control send timed out".into()));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush().ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slatecast_core::protocol::MSG_AUTH_REQUEST;
    use std::net::TcpStream;

    fn listener_pair() -> (ControlListener, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        let control = ControlListener { listener, tls: None };
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        (control, client)
    }

    fn accept(control: &mut ControlListener) -> ControlChannel {
        for _ in 0..100 {
            if let Some(channel) = control.try_accept().unwrap() {
                return channel;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("accept timed out");
    }

    #[test]
    fn handshake_round_trip() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        // ConfigRequest: 2800x1752, video port 40000, reserved 0
        let mut payload = Vec::new();
        ConfigRequest {
            width: 2800,
            height: 1752,
            video_port: 40_000,
            audio_port: 0,
        }
        .write(&mut payload);
        client
            .write_all(&encode_control_message(MSG_CONFIG_REQUEST, &payload))
            .unwrap();

        let descriptor = channel.wait_config_request(Duration::from_secs(2)).unwrap();
        assert_eq!(descriptor.width, 2800);
        assert_eq!(descriptor.height, 1752);
        assert_eq!(descriptor.video_port, 40_000);

        channel
            .send_config(&ConfigResponse {
                screen_width: 1920,
                screen_height: 1080,
                video_port: 9501,
                input_port: 9502,
                audio_port: 9503,
                audio_sample_rate: 48_000,
                audio_channels: 2,
                audio_frame_ms: 10,
                codec_id: 0,
            })
            .unwrap();

        let mut header = [0u8; 3];
        client.read_exact(&mut header).unwrap();
        assert_eq!(u16::from_be_bytes([header[0], header[1]]), 16);
        assert_eq!(header[2], MSG_CONFIG_RESPONSE);

        let mut body = [0u8; 15];
        client.read_exact(&mut body).unwrap();
        let response = ConfigResponse::parse(&body).unwrap();
        assert_eq!(response.screen_width, 1920);
        assert_eq!(response.codec_id, 0);
    }

    #[test]
    fn keyframe_request_is_surfaced_once_per_message() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        // The exact 3-byte wire form: 00 01 05
        client.write_all(&[0x00, 0x01, 0x05]).unwrap();
        client.write_all(&[0x00, 0x01, 0x05]).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let events = channel.poll();
        assert_eq!(
            events,
            vec![ControlEvent::KeyframeRequest, ControlEvent::KeyframeRequest]
        );
    }

    #[test]
    fn ping_is_echoed_as_pong_with_same_payload() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        client
            .write_all(&encode_control_message(MSG_PING, &[0xde, 0xad]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(channel.poll().is_empty());

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x00, 0x03, MSG_PONG, 0xde, 0xad]);
    }

    #[test]
    fn disconnect_message_ends_the_session() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        client
            .write_all(&encode_control_message(MSG_DISCONNECT, &[]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let events = channel.poll();
        assert!(events.contains(&ControlEvent::Disconnect));
        assert!(!channel.is_connected());
    }

    #[test]
    fn eof_ends_the_session() {
        let (mut control, client) = listener_pair();
        let mut channel = accept(&mut control);

        drop(client);
        std::thread::sleep(Duration::from_millis(50));

        let events = channel.poll();
        assert!(events.contains(&ControlEvent::Disconnect));
    }

    #[test]
    fn unknown_message_types_are_skipped_not_fatal() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        client
            .write_all(&encode_control_message(MSG_AUTH_REQUEST, &[1, 2, 3]))
            .unwrap();
        client.write_all(&[0x00, 0x01, 0x05]).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let events = channel.poll();
        assert_eq!(events, vec![ControlEvent::KeyframeRequest]);
        assert!(channel.is_connected());
    }

    #[test]
    fn partial_messages_wait_for_the_rest() {
        let (mut control, mut client) = listener_pair();
        let mut channel = accept(&mut control);

        client.write_all(&[0x00]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(channel.poll().is_empty());

        client.write_all(&[0x01, 0x05]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.poll(), vec![ControlEvent::KeyframeRequest]);
    }
}
