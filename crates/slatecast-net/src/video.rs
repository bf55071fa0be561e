//! UDP video sender with fragmentation and congestion pacing
//!
//! Keyframes are an order of magnitude larger than deltas; bursting them
//! wholesale overruns tablet receive buffers, so pacing inserts short
//! sleeps between bursts of fragments within one frame.

use bytes::{BufMut, BytesMut};
use slatecast_core::protocol::{
    VideoPacketHeader, FLAG_END_OF_FRAME, FLAG_KEYFRAME, FLAG_START_OF_FRAME, MAX_PACKET_PAYLOAD,
};
use slatecast_core::{EncodedFrame, Error, PacingMode, Result};
use socket2::{Domain, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::info;

const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PacingParams {
    /// Frames larger than this are paced
    threshold: usize,
    packets_per_burst: u32,
    burst_delay: Duration,
}

impl PacingParams {
    fn for_mode(mode: PacingMode) -> Self {
        match mode {
            PacingMode::None | PacingMode::Auto => Self {
                threshold: usize::MAX,
                packets_per_burst: 0,
                burst_delay: Duration::ZERO,
            },
            PacingMode::Light => Self {
                threshold: 50_000,
                packets_per_burst: 20,
                burst_delay: Duration::from_micros(50),
            },
            PacingMode::Aggressive => Self {
                threshold: 2_400,
                packets_per_burst: 4,
                burst_delay: Duration::from_micros(200),
            },
            PacingMode::Keyframe => Self {
                threshold: 0,
                packets_per_burst: 8,
                burst_delay: Duration::from_micros(100),
            },
        }
    }
}

/// Resolve PacingMode::Auto from the receiver's address. USB tethering and
/// phone hotspots show up as 10.x or 192.168.42/43 and need heavy pacing.
fn detect_pacing_mode(ip: IpAddr) -> PacingMode {
    let IpAddr::V4(v4) = ip else {
        return PacingMode::Light;
    };
    let octets = v4.octets();
    if octets[0] == 10 {
        info!("Receiver on 10.x.x.x (USB/cellular), using aggressive pacing");
        return PacingMode::Aggressive;
    }
    if octets[0] == 192 && octets[1] == 168 && (octets[2] == 42 || octets[2] == 43) {
        info!("Receiver on Android tethering range, using aggressive pacing");
        return PacingMode::Aggressive;
    }
    info!("Receiver on LAN/WiFi, using light pacing");
    PacingMode::Light
}

/// Pacing for one keyframe under keyframe-only mode, selected by size
fn keyframe_tier(size: usize) -> Option<(u32, Duration)> {
    if size <= 100_000 {
        None
    } else if size <= 300_000 {
        Some((6, Duration::from_micros(150)))
    } else if size <= 500_000 {
        Some((4, Duration::from_micros(200)))
    } else {
        Some((2, Duration::from_micros(300)))
    }
}

/// UDP sender for encoded video frames
pub struct VideoSender {
    socket: UdpSocket,
    destination: Option<SocketAddr>,
    mode: PacingMode,
    pacing: PacingParams,
    sequence: u16,
    bytes_sent: u64,
    packets_sent: u64,
}

impl VideoSender {
    /// Bind the UDP socket with an enlarged send buffer
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_send_buffer_size(SEND_BUFFER_BYTES)?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();

        info!("Video sender bound on port {}", port);

        Ok(Self {
            socket,
            destination: None,
            mode: PacingMode::None,
            pacing: PacingParams::for_mode(PacingMode::None),
            sequence: 0,
            bytes_sent: 0,
            packets_sent: 0,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Point the sender at a new receiver, resolving Auto pacing from its IP
    pub fn set_destination(&mut self, ip: IpAddr, port: u16, mode: PacingMode) {
        let mode = if mode == PacingMode::Auto {
            detect_pacing_mode(ip)
        } else {
            mode
        };
        self.mode = mode;
        self.pacing = PacingParams::for_mode(mode);
        self.destination = Some(SocketAddr::new(ip, port));

        info!("Video destination set to {}:{} (pacing {:?})", ip, port, mode);
    }

    pub fn clear_destination(&mut self) {
        self.destination = None;
    }

    pub fn pacing_mode(&self) -> PacingMode {
        self.mode
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Fragment and send one encoded frame. Returns Ok(false) when no
    /// receiver is connected.
    pub fn send_frame(&mut self, frame: &EncodedFrame, frame_number: u16) -> Result<bool> {
        let Some(dest) = self.destination else {
            return Ok(false);
        };

        let data = &frame.data;
        let fragment_count = data.len().div_ceil(MAX_PACKET_PAYLOAD);
        if fragment_count == 0 {
            return Ok(false);
        }
        if fragment_count > u16::MAX as usize {
            return Err(Error::Protocol(format!(
                "frame too large: {} bytes needs {} fragments",
                data.len(),
                fragment_count
            )));
        }

        if frame.is_keyframe {
            info!(
                "Keyframe {}: {} bytes ({} packets)",
                frame_number,
                data.len(),
                fragment_count
            );
        }

        // Pacing parameters for this frame
        let (need_pacing, burst, delay) = match self.mode {
            PacingMode::Keyframe => match (frame.is_keyframe, keyframe_tier(data.len())) {
                (true, Some((burst, delay))) => (true, burst, delay),
                _ => (false, 0, Duration::ZERO),
            },
            PacingMode::None | PacingMode::Auto => (false, 0, Duration::ZERO),
            _ => (
                data.len() > self.pacing.threshold,
                self.pacing.packets_per_burst,
                self.pacing.burst_delay,
            ),
        };

        let mut packet = BytesMut::with_capacity(VideoPacketHeader::SIZE + MAX_PACKET_PAYLOAD);
        let mut packets_in_burst = 0u32;

        for (idx, chunk) in data.chunks(MAX_PACKET_PAYLOAD).enumerate() {
            let mut flags = 0u8;
            if frame.is_keyframe {
                flags |= FLAG_KEYFRAME;
            }
            if idx == 0 {
                flags |= FLAG_START_OF_FRAME;
            }
            if idx == fragment_count - 1 {
                flags |= FLAG_END_OF_FRAME;
            }

            packet.clear();
            VideoPacketHeader {
                sequence: self.sequence,
                frame_number,
                flags,
                fragment_idx: idx as u16,
                fragment_count: fragment_count as u16,
                payload_len: chunk.len() as u16,
            }
            .write(&mut packet);
            packet.put_slice(chunk);
            self.sequence = self.sequence.wrapping_add(1);

            let sent = self.socket.send_to(&packet, dest)?;
            self.bytes_sent += sent as u64;
            self.packets_sent += 1;

            if need_pacing {
                packets_in_burst += 1;
                if packets_in_burst >= burst && idx < fragment_count - 1 {
                    std::thread::sleep(delay);
                    packets_in_burst = 0;
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slatecast_core::frame::timestamp_us;

    fn frame(size: usize, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            data: (0..size).map(|i| i as u8).collect(),
            timestamp_us: timestamp_us(),
            is_keyframe: keyframe,
        }
    }

    fn sender_and_receiver() -> (VideoSender, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut sender = VideoSender::bind(0).unwrap();
        sender.set_destination(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            receiver.local_addr().unwrap().port(),
            PacingMode::None,
        );
        (sender, receiver)
    }

    fn recv_all(receiver: &UdpSocket, count: usize) -> Vec<(VideoPacketHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let mut buf = [0u8; 2048];
        for _ in 0..count {
            let n = receiver.recv(&mut buf).unwrap();
            let header = VideoPacketHeader::parse(&buf[..n]).unwrap();
            assert_eq!(
                n,
                VideoPacketHeader::SIZE + header.payload_len as usize,
                "datagram length must match the header"
            );
            out.push((header, buf[VideoPacketHeader::SIZE..n].to_vec()));
        }
        out
    }

    #[test]
    fn fragments_cover_the_frame_in_order() {
        let (mut sender, receiver) = sender_and_receiver();
        let frame = frame(2_500, false);
        assert!(sender.send_frame(&frame, 7).unwrap());

        let packets = recv_all(&receiver, 3);
        let mut reassembled = Vec::new();
        for (idx, (header, payload)) in packets.iter().enumerate() {
            assert_eq!(header.fragment_idx as usize, idx);
            assert_eq!(header.fragment_count, 3);
            assert_eq!(header.frame_number, 7);
            assert!(!header.is_keyframe());
            assert_eq!(header.is_start(), idx == 0);
            assert_eq!(header.is_end(), idx == 2);
            reassembled.extend_from_slice(payload);
        }
        assert_eq!(reassembled, frame.data);
    }

    #[test]
    fn exact_payload_size_is_a_single_fragment() {
        let (mut sender, receiver) = sender_and_receiver();
        sender.send_frame(&frame(MAX_PACKET_PAYLOAD, false), 1).unwrap();

        let packets = recv_all(&receiver, 1);
        let header = packets[0].0;
        assert_eq!(header.fragment_count, 1);
        assert!(header.is_start());
        assert!(header.is_end());
        assert_eq!(header.payload_len as usize, MAX_PACKET_PAYLOAD);
    }

    #[test]
    fn keyframe_flag_is_on_every_fragment() {
        let (mut sender, receiver) = sender_and_receiver();
        sender.send_frame(&frame(5_000, true), 2).unwrap();

        for (header, _) in recv_all(&receiver, 5) {
            assert!(header.is_keyframe());
        }
    }

    #[test]
    fn sequence_runs_across_frames() {
        let (mut sender, receiver) = sender_and_receiver();
        sender.send_frame(&frame(1_000, false), 0).unwrap();
        sender.send_frame(&frame(1_000, false), 1).unwrap();

        let packets = recv_all(&receiver, 2);
        let first = packets[0].0.sequence;
        assert_eq!(packets[1].0.sequence, first.wrapping_add(1));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (mut sender, _receiver) = sender_and_receiver();
        let frame = frame(MAX_PACKET_PAYLOAD * (u16::MAX as usize + 1), false);
        assert!(sender.send_frame(&frame, 0).is_err());
    }

    #[test]
    fn no_destination_sends_nothing() {
        let mut sender = VideoSender::bind(0).unwrap();
        assert!(!sender.send_frame(&frame(100, false), 0).unwrap());
        assert_eq!(sender.packets_sent(), 0);
    }

    #[test]
    fn counters_track_bytes_and_packets() {
        let (mut sender, receiver) = sender_and_receiver();
        sender.send_frame(&frame(2_500, false), 0).unwrap();
        recv_all(&receiver, 3);
        assert_eq!(sender.packets_sent(), 3);
        assert_eq!(sender.bytes_sent(), 2_500 + 3 * VideoPacketHeader::SIZE as u64);
    }

    #[test]
    fn auto_pacing_resolves_from_receiver_ip() {
        assert_eq!(
            detect_pacing_mode("10.1.2.3".parse().unwrap()),
            PacingMode::Aggressive
        );
        assert_eq!(
            detect_pacing_mode("192.168.42.5".parse().unwrap()),
            PacingMode::Aggressive
        );
        assert_eq!(
            detect_pacing_mode("192.168.43.9".parse().unwrap()),
            PacingMode::Aggressive
        );
        assert_eq!(
            detect_pacing_mode("192.168.1.50".parse().unwrap()),
            PacingMode::Light
        );
        assert_eq!(
            detect_pacing_mode("172.16.0.2".parse().unwrap()),
            PacingMode::Light
        );
    }

    #[test]
    fn keyframe_tiers_select_by_size() {
        assert_eq!(keyframe_tier(80_000), None);
        assert_eq!(keyframe_tier(200_000), Some((6, Duration::from_micros(150))));
        assert_eq!(keyframe_tier(400_000), Some((4, Duration::from_micros(200))));
        assert_eq!(
            keyframe_tier(1_500_000),
            Some((2, Duration::from_micros(300)))
        );
    }
}
