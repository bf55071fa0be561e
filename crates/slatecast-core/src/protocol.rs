//! Wire protocol: packet headers, input event records and control framing
//!
//! Video and audio packet headers plus the input record are little-endian;
//! the control channel framing and its payloads are big-endian. The
//! asymmetry is part of the protocol and must not be "fixed".

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// "ST", first two bytes of every video datagram
pub const VIDEO_MAGIC: u16 = 0x5354;
/// "SA", first two bytes of every audio datagram
pub const AUDIO_MAGIC: u16 = 0x5341;

/// Maximum payload bytes per video fragment (MTU safe)
pub const MAX_PACKET_PAYLOAD: usize = 1200;

pub const FLAG_KEYFRAME: u8 = 0x01;
pub const FLAG_START_OF_FRAME: u8 = 0x02;
pub const FLAG_END_OF_FRAME: u8 = 0x04;

/// Control message types
pub const MSG_AUTH_REQUEST: u8 = 0x01;
pub const MSG_AUTH_RESPONSE: u8 = 0x02;
pub const MSG_CONFIG_REQUEST: u8 = 0x03;
pub const MSG_CONFIG_RESPONSE: u8 = 0x04;
pub const MSG_KEYFRAME_REQUEST: u8 = 0x05;
pub const MSG_PING: u8 = 0x06;
pub const MSG_PONG: u8 = 0x07;
pub const MSG_DISCONNECT: u8 = 0x08;

/// Stylus button bits in the input record
pub const BTN_BIT_SECONDARY: u16 = 0x02;
pub const BTN_BIT_TERTIARY: u16 = 0x04;
pub const BTN_BIT_ERASER: u16 = 0x20;

/// Header prefixed to every video fragment (16 bytes, little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPacketHeader {
    /// Free-running per-datagram counter, wraps
    pub sequence: u16,
    /// Frame number, wraps at 16 bits
    pub frame_number: u16,
    pub flags: u8,
    /// 0-based fragment index within the frame
    pub fragment_idx: u16,
    /// Total fragments in this frame
    pub fragment_count: u16,
    /// Payload bytes following the header, 1..=1200
    pub payload_len: u16,
}

impl VideoPacketHeader {
    pub const SIZE: usize = 16;

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(VIDEO_MAGIC);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.frame_number);
        buf.put_u8(self.flags);
        buf.put_u8(0); // reserved
        buf.put_u16_le(self.fragment_idx);
        buf.put_u16_le(self.fragment_count);
        buf.put_u16_le(self.payload_len);
        buf.put_u16_le(0); // reserved2
    }

    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Protocol("video header truncated".into()));
        }
        let magic = data.get_u16_le();
        if magic != VIDEO_MAGIC {
            return Err(Error::Protocol(format!("bad video magic 0x{:04x}", magic)));
        }
        let sequence = data.get_u16_le();
        let frame_number = data.get_u16_le();
        let flags = data.get_u8();
        let _reserved = data.get_u8();
        let fragment_idx = data.get_u16_le();
        let fragment_count = data.get_u16_le();
        let payload_len = data.get_u16_le();
        Ok(Self {
            sequence,
            frame_number,
            flags,
            fragment_idx,
            fragment_count,
            payload_len,
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    pub fn is_start(&self) -> bool {
        self.flags & FLAG_START_OF_FRAME != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END_OF_FRAME != 0
    }
}

/// Header prefixed to every audio datagram (12 bytes, little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacketHeader {
    pub sequence: u16,
    /// Timestamp in 48 kHz sample units, wraps at 32 bits
    pub timestamp: u32,
    pub payload_len: u16,
}

impl AudioPacketHeader {
    pub const SIZE: usize = 12;

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(AUDIO_MAGIC);
        buf.put_u16_le(self.sequence);
        buf.put_u32_le(self.timestamp);
        buf.put_u16_le(self.payload_len);
        buf.put_u16_le(0); // reserved
    }

    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Protocol("audio header truncated".into()));
        }
        let magic = data.get_u16_le();
        if magic != AUDIO_MAGIC {
            return Err(Error::Protocol(format!("bad audio magic 0x{:04x}", magic)));
        }
        let sequence = data.get_u16_le();
        let timestamp = data.get_u32_le();
        let payload_len = data.get_u16_le();
        Ok(Self {
            sequence,
            timestamp,
            payload_len,
        })
    }
}

/// Kind tag of an input event record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputEventKind {
    TouchDown = 0x01,
    TouchMove = 0x02,
    TouchUp = 0x03,
    StylusDown = 0x04,
    StylusMove = 0x05,
    StylusUp = 0x06,
    StylusHover = 0x07,
    KeyDown = 0x08,
    KeyUp = 0x09,
    Scroll = 0x0a,
}

impl TryFrom<u8> for InputEventKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(InputEventKind::TouchDown),
            0x02 => Ok(InputEventKind::TouchMove),
            0x03 => Ok(InputEventKind::TouchUp),
            0x04 => Ok(InputEventKind::StylusDown),
            0x05 => Ok(InputEventKind::StylusMove),
            0x06 => Ok(InputEventKind::StylusUp),
            0x07 => Ok(InputEventKind::StylusHover),
            0x08 => Ok(InputEventKind::KeyDown),
            0x09 => Ok(InputEventKind::KeyUp),
            0x0a => Ok(InputEventKind::Scroll),
            other => Err(Error::Protocol(format!("unknown input event kind 0x{:02x}", other))),
        }
    }
}

/// A fixed 28-byte input record streamed over the input TCP connection
///
/// For KeyDown/KeyUp, `buttons` carries the Linux key code and the float
/// fields are zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: InputEventKind,
    pub pointer_id: u8,
    /// Normalized 0-1
    pub x: f32,
    /// Normalized 0-1
    pub y: f32,
    /// Normalized 0-1
    pub pressure: f32,
    /// Radians
    pub tilt_x: f32,
    /// Radians
    pub tilt_y: f32,
    pub buttons: u16,
    pub timestamp_ms: u32,
}

impl InputEvent {
    pub const SIZE: usize = 28;

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.pointer_id);
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.pressure);
        buf.put_f32_le(self.tilt_x);
        buf.put_f32_le(self.tilt_y);
        buf.put_u16_le(self.buttons);
        buf.put_u32_le(self.timestamp_ms);
    }

    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Protocol("input record truncated".into()));
        }
        let kind = InputEventKind::try_from(data.get_u8())?;
        let pointer_id = data.get_u8();
        let x = data.get_f32_le();
        let y = data.get_f32_le();
        let pressure = data.get_f32_le();
        let tilt_x = data.get_f32_le();
        let tilt_y = data.get_f32_le();
        let buttons = data.get_u16_le();
        let timestamp_ms = data.get_u32_le();
        Ok(Self {
            kind,
            pointer_id,
            x,
            y,
            pressure,
            tilt_x,
            tilt_y,
            buttons,
            timestamp_ms,
        })
    }

    pub fn eraser(&self) -> bool {
        self.buttons & BTN_BIT_ERASER != 0
    }
}

/// Receiver handshake request: `[width(2) | height(2) | video port(2) | audio port(2)]`,
/// big-endian. The trailing field is reserved on old receivers and reads as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRequest {
    pub width: u16,
    pub height: u16,
    pub video_port: u16,
    pub audio_port: u16,
}

impl ConfigRequest {
    pub const SIZE: usize = 8;

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u16(self.video_port);
        buf.put_u16(self.audio_port);
    }

    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Protocol("config request truncated".into()));
        }
        Ok(Self {
            width: data.get_u16(),
            height: data.get_u16(),
            video_port: data.get_u16(),
            audio_port: data.get_u16(),
        })
    }
}

/// Server handshake reply, always emitted in the full 15-byte form.
/// Receivers may truncate to the first 8 or 14 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigResponse {
    pub screen_width: u16,
    pub screen_height: u16,
    pub video_port: u16,
    pub input_port: u16,
    /// 0 when audio is disabled
    pub audio_port: u16,
    pub audio_sample_rate: u16,
    pub audio_channels: u8,
    pub audio_frame_ms: u8,
    /// 0 = AV1, 1 = HEVC, 2 = H.264
    pub codec_id: u8,
}

impl ConfigResponse {
    pub const SIZE: usize = 15;

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.screen_width);
        buf.put_u16(self.screen_height);
        buf.put_u16(self.video_port);
        buf.put_u16(self.input_port);
        buf.put_u16(self.audio_port);
        buf.put_u16(self.audio_sample_rate);
        buf.put_u8(self.audio_channels);
        buf.put_u8(self.audio_frame_ms);
        buf.put_u8(self.codec_id);
    }

    /// Parse any of the historical 8/14/15-byte forms by truncation
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Protocol("config response truncated".into()));
        }
        let screen_width = data.get_u16();
        let screen_height = data.get_u16();
        let video_port = data.get_u16();
        let input_port = data.get_u16();
        let (audio_port, audio_sample_rate, audio_channels, audio_frame_ms) = if data.remaining() >= 6 {
            (data.get_u16(), data.get_u16(), data.get_u8(), data.get_u8())
        } else {
            (0, 0, 0, 0)
        };
        let codec_id = if data.remaining() >= 1 { data.get_u8() } else { 2 };
        Ok(Self {
            screen_width,
            screen_height,
            video_port,
            input_port,
            audio_port,
            audio_sample_rate,
            audio_channels,
            audio_frame_ms,
            codec_id,
        })
    }
}

/// Frame a control message: `[length(2, big-endian) | type(1) | payload]`
/// where length counts the type byte plus the payload.
pub fn encode_control_message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.put_u16((payload.len() + 1) as u16);
    out.put_u8(msg_type);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_header_is_exactly_16_bytes_with_spec_offsets() {
        let header = VideoPacketHeader {
            sequence: 0x0201,
            frame_number: 0x0403,
            flags: FLAG_KEYFRAME | FLAG_START_OF_FRAME,
            fragment_idx: 0x0605,
            fragment_count: 0x0807,
            payload_len: 1200,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), VideoPacketHeader::SIZE);

        // magic "ST" little-endian
        assert_eq!(&buf[0..2], &[0x54, 0x53]);
        assert_eq!(&buf[2..4], &[0x01, 0x02]);
        assert_eq!(&buf[4..6], &[0x03, 0x04]);
        assert_eq!(buf[6], 0x03);
        assert_eq!(buf[7], 0);
        assert_eq!(&buf[8..10], &[0x05, 0x06]);
        assert_eq!(&buf[10..12], &[0x07, 0x08]);
        assert_eq!(&buf[12..14], &[0xb0, 0x04]);
        assert_eq!(&buf[14..16], &[0, 0]);

        let parsed = VideoPacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_keyframe());
        assert!(parsed.is_start());
        assert!(!parsed.is_end());
    }

    #[test]
    fn audio_header_is_exactly_12_bytes() {
        let header = AudioPacketHeader {
            sequence: 7,
            timestamp: 0xdead_beef,
            payload_len: 160,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), AudioPacketHeader::SIZE);
        assert_eq!(&buf[0..2], &[0x41, 0x53]); // "SA" little-endian

        let parsed = AudioPacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        VideoPacketHeader {
            sequence: 0,
            frame_number: 0,
            flags: 0,
            fragment_idx: 0,
            fragment_count: 1,
            payload_len: 1,
        }
        .write(&mut buf);
        buf[0] = 0xff;
        assert!(VideoPacketHeader::parse(&buf).is_err());
    }

    #[test]
    fn input_record_round_trips_bit_exact() {
        let event = InputEvent {
            kind: InputEventKind::StylusMove,
            pointer_id: 3,
            x: 0.12345,
            y: 0.99999,
            pressure: 0.5,
            tilt_x: -0.7853982,
            tilt_y: 0.1,
            buttons: BTN_BIT_ERASER | BTN_BIT_SECONDARY,
            timestamp_ms: 123_456_789,
        };
        let mut buf = Vec::new();
        event.write(&mut buf);
        assert_eq!(buf.len(), InputEvent::SIZE);

        let parsed = InputEvent::parse(&buf).unwrap();
        assert_eq!(parsed.kind, event.kind);
        assert_eq!(parsed.x.to_bits(), event.x.to_bits());
        assert_eq!(parsed.y.to_bits(), event.y.to_bits());
        assert_eq!(parsed.pressure.to_bits(), event.pressure.to_bits());
        assert_eq!(parsed.tilt_x.to_bits(), event.tilt_x.to_bits());
        assert_eq!(parsed.tilt_y.to_bits(), event.tilt_y.to_bits());
        assert_eq!(parsed.buttons, event.buttons);
        assert_eq!(parsed.timestamp_ms, event.timestamp_ms);
        assert!(parsed.eraser());
    }

    #[test]
    fn unknown_input_kind_is_an_error() {
        let mut buf = vec![0u8; InputEvent::SIZE];
        buf[0] = 0x42;
        assert!(InputEvent::parse(&buf).is_err());
    }

    #[test]
    fn malformed_input_records_never_panic() {
        for len in 0..InputEvent::SIZE {
            let buf = vec![0xa5u8; len];
            assert!(InputEvent::parse(&buf).is_err());
        }
    }

    #[test]
    fn config_request_is_big_endian() {
        let req = ConfigRequest {
            width: 2800,
            height: 1752,
            video_port: 40_000,
            audio_port: 0,
        };
        let mut buf = Vec::new();
        req.write(&mut buf);
        assert_eq!(buf.len(), ConfigRequest::SIZE);
        assert_eq!(&buf[0..2], &2800u16.to_be_bytes());
        assert_eq!(&buf[4..6], &40_000u16.to_be_bytes());
        assert_eq!(ConfigRequest::parse(&buf).unwrap(), req);
    }

    #[test]
    fn config_response_emits_15_bytes_and_parses_short_forms() {
        let resp = ConfigResponse {
            screen_width: 1920,
            screen_height: 1080,
            video_port: 9501,
            input_port: 9502,
            audio_port: 9503,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_frame_ms: 10,
            codec_id: 0,
        };
        let mut buf = Vec::new();
        resp.write(&mut buf);
        assert_eq!(buf.len(), ConfigResponse::SIZE);

        // A receiver that only understands the short form still works
        let short = ConfigResponse::parse(&buf[..8]).unwrap();
        assert_eq!(short.screen_width, 1920);
        assert_eq!(short.video_port, 9501);
        assert_eq!(short.audio_port, 0);

        let medium = ConfigResponse::parse(&buf[..14]).unwrap();
        assert_eq!(medium.audio_sample_rate, 48_000);
        assert_eq!(medium.codec_id, 2);

        assert_eq!(ConfigResponse::parse(&buf).unwrap(), resp);
    }

    #[test]
    fn control_framing_counts_type_plus_payload() {
        let msg = encode_control_message(MSG_KEYFRAME_REQUEST, &[]);
        assert_eq!(msg, vec![0x00, 0x01, 0x05]);

        let msg = encode_control_message(MSG_PING, &[0xaa, 0xbb]);
        assert_eq!(msg, vec![0x00, 0x03, MSG_PING, 0xaa, 0xbb]);
    }
}
