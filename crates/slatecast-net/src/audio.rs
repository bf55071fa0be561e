//! UDP sender for encoded audio packets
//!
//! One Opus packet per datagram behind a 12-byte header; audio frames are
//! small enough that fragmentation is never needed.

use bytes::{BufMut, BytesMut};
use slatecast_core::protocol::AudioPacketHeader;
use slatecast_core::Result;
use socket2::{Domain, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::info;

const SEND_BUFFER_BYTES: usize = 256 * 1024;

pub struct AudioSender {
    socket: UdpSocket,
    destination: Option<SocketAddr>,
    bytes_sent: u64,
    packets_sent: u64,
}

impl AudioSender {
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_send_buffer_size(SEND_BUFFER_BYTES)?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();

        info!("Audio sender bound on port {}", port);

        Ok(Self {
            socket,
            destination: None,
            bytes_sent: 0,
            packets_sent: 0,
        })
    }

    pub fn set_destination(&mut self, ip: IpAddr, port: u16) {
        self.destination = Some(SocketAddr::new(ip, port));
        info!("Audio destination set to {}:{}", ip, port);
    }

    pub fn clear_destination(&mut self) {
        self.destination = None;
    }

    pub fn has_destination(&self) -> bool {
        self.destination.is_some()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Send one Opus packet. `timestamp` is in 48 kHz sample units and
    /// wraps with the u32.
    pub fn send_packet(&mut self, payload: &[u8], sequence: u16, timestamp: u32) -> Result<bool> {
        let Some(dest) = self.destination else {
            return Ok(false);
        };

        let mut packet = BytesMut::with_capacity(AudioPacketHeader::SIZE + payload.len());
        AudioPacketHeader {
            sequence,
            timestamp,
            payload_len: payload.len() as u16,
        }
        .write(&mut packet);
        packet.put_slice(payload);

        let sent = self.socket.send_to(&packet, dest)?;
        self.bytes_sent += sent as u64;
        self.packets_sent += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn packet_carries_header_and_opus_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut sender = AudioSender::bind(0).unwrap();
        sender.set_destination(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            receiver.local_addr().unwrap().port(),
        );

        let opus = [0x11u8; 160];
        assert!(sender.send_packet(&opus, 42, 480_000).unwrap());

        let mut buf = [0u8; 512];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(n, AudioPacketHeader::SIZE + opus.len());

        let header = AudioPacketHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.sequence, 42);
        assert_eq!(header.timestamp, 480_000);
        assert_eq!(header.payload_len as usize, opus.len());
        assert_eq!(&buf[AudioPacketHeader::SIZE..n], &opus[..]);
    }

    #[test]
    fn without_destination_nothing_is_sent() {
        let mut sender = AudioSender::bind(0).unwrap();
        assert!(!sender.send_packet(&[0u8; 10], 0, 0).unwrap());
        assert_eq!(sender.packets_sent(), 0);
    }
}
