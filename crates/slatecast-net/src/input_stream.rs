//! TCP listener for the input event stream
//!
//! The receiver streams fixed 28-byte records with no framing overhead.
//! Both the listener and the client socket run nonblocking; the drain is
//! called inline with the orchestrator tick so injection latency stays
//! below one frame interval.

use slatecast_core::protocol::InputEvent;
use slatecast_core::Result;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct InputListener {
    listener: TcpListener,
    client: Option<InputClient>,
}

struct InputClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl InputListener {
    pub fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        info!("Input receiver listening on port {}", port);

        Ok(Self { listener, client: None })
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Accept a waiting receiver (if none is connected) and drain every
    /// complete record that has arrived.
    pub fn poll(&mut self) -> Vec<InputEvent> {
        if self.client.is_none() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("Input client connected from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY failed: {}", e);
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Could not make input socket nonblocking: {}", e);
                        return Vec::new();
                    }
                    self.client = Some(InputClient { stream, buf: Vec::new() });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Vec::new(),
                Err(e) => {
                    debug!("Input accept error: {}", e);
                    return Vec::new();
                }
            }
        }

        let Some(client) = self.client.as_mut() else {
            return Vec::new();
        };

        let mut disconnected = false;
        let mut chunk = [0u8; 4096];
        loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("Input client disconnected");
                    disconnected = true;
                    break;
                }
                Ok(n) => client.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Input read error: {}", e);
                    disconnected = true;
                    break;
                }
            }
        }

        let mut events = Vec::new();
        let mut offset = 0;
        while client.buf.len() - offset >= InputEvent::SIZE {
            let record = &client.buf[offset..offset + InputEvent::SIZE];
            offset += InputEvent::SIZE;
            match InputEvent::parse(record) {
                Ok(event) => events.push(event),
                // A single bad record is dropped, the stream continues
                Err(e) => debug!("Discarding malformed input record: {}", e),
            }
        }
        client.buf.drain(..offset);

        if disconnected {
            self.client = None;
        }
        events
    }

    /// Drop the connected client, keeping the listening socket
    pub fn reset(&mut self) {
        self.client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slatecast_core::protocol::InputEventKind;
    use std::io::Write;
    use std::time::Duration;

    fn pair() -> (InputListener, TcpStream) {
        let listener = InputListener::bind(0).unwrap();
        let port = listener.listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        (listener, client)
    }

    fn wire(event: &InputEvent) -> Vec<u8> {
        let mut buf = Vec::new();
        event.write(&mut buf);
        buf
    }

    fn touch_down(x: f32, y: f32) -> InputEvent {
        InputEvent {
            kind: InputEventKind::TouchDown,
            pointer_id: 0,
            x,
            y,
            pressure: 0.8,
            tilt_x: 0.0,
            tilt_y: 0.0,
            buttons: 0,
            timestamp_ms: 1,
        }
    }

    fn drain(listener: &mut InputListener) -> Vec<InputEvent> {
        let mut events = Vec::new();
        for _ in 0..100 {
            events.extend(listener.poll());
            if !events.is_empty() {
                return events;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn records_arrive_in_order() {
        let (mut listener, mut client) = pair();

        let first = touch_down(0.5, 0.5);
        let mut second = first;
        second.kind = InputEventKind::TouchUp;

        client.write_all(&wire(&first)).unwrap();
        client.write_all(&wire(&second)).unwrap();

        let events = drain(&mut listener);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, InputEventKind::TouchDown);
        assert_eq!(events[1].kind, InputEventKind::TouchUp);
        assert_eq!(events[0].x.to_bits(), 0.5f32.to_bits());
    }

    #[test]
    fn partial_record_waits_for_completion() {
        let (mut listener, mut client) = pair();
        let bytes = wire(&touch_down(0.1, 0.2));

        client.write_all(&bytes[..10]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(listener.poll().is_empty() || !listener.is_connected());

        client.write_all(&bytes[10..]).unwrap();
        let events = drain(&mut listener);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_record_is_dropped_without_disconnect() {
        let (mut listener, mut client) = pair();

        let mut bad = wire(&touch_down(0.1, 0.2));
        bad[0] = 0xff; // unknown kind
        client.write_all(&bad).unwrap();
        client.write_all(&wire(&touch_down(0.3, 0.4))).unwrap();

        let events = drain(&mut listener);
        assert_eq!(events.len(), 1);
        assert!(listener.is_connected());
    }

    #[test]
    fn client_eof_frees_the_listener_for_a_new_receiver() {
        let (mut listener, client) = pair();
        drain(&mut listener); // accept
        assert!(listener.is_connected());

        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        listener.poll();
        assert!(!listener.is_connected());
    }
}
