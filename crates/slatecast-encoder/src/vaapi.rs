//! VAAPI hardware encoder built on the FFmpeg C API
//!
//! The probe walks every /dev/dri render node with each candidate codec
//! (AV1 first, H.264 last) and keeps the first combination whose encoder
//! actually opens. Frames are converted to NV12 on the CPU, uploaded into a
//! hardware surface pool and encoded with zero lookahead.

use crate::convert::bgra_to_nv12;
use ffmpeg_next::ffi;
use slatecast_core::{Codec, EncodedFrame, EncoderConfig, Error, QualityMode, RawFrame, Result};
use std::ffi::CString;
use std::ptr;
use std::sync::Once;
use tracing::{debug, info, warn};

const fn averror(code: i32) -> i32 {
    -code
}

fn av_err(ret: i32) -> String {
    let mut buf = [0i8; ffi::AV_ERROR_MAX_STRING_SIZE as usize];
    unsafe {
        ffi::av_strerror(ret, buf.as_mut_ptr(), buf.len());
        std::ffi::CStr::from_ptr(buf.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

fn encoder_name(codec: Codec) -> &'static str {
    match codec {
        Codec::Av1 => "av1_vaapi",
        Codec::Hevc => "hevc_vaapi",
        Codec::H264 => "h264_vaapi",
    }
}

/// Render devices under /dev/dri, sorted for a stable probe order
fn render_devices() -> Vec<String> {
    let mut devices: Vec<String> = std::fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name.starts_with("renderD"))
                .map(|name| format!("/dev/dri/{}", name))
                .collect()
        })
        .unwrap_or_default();
    devices.sort();
    devices
}

/// GPU encoder context. Owns the hardware device, the surface pool and the
/// scratch frames; everything is released in reverse order on drop.
pub struct VaapiEncoder {
    codec_ctx: *mut ffi::AVCodecContext,
    hw_device: *mut ffi::AVBufferRef,
    hw_frames: *mut ffi::AVBufferRef,
    sw_frame: *mut ffi::AVFrame,
    hw_frame: *mut ffi::AVFrame,
    packet: *mut ffi::AVPacket,
    codec: Codec,
    width: u32,
    height: u32,
    bitrate: u32,
    frame_count: i64,
    force_keyframe: bool,
}

// Safety: all pointers are owned by this value and only used from the
// pipeline thread that owns the encoder.
unsafe impl Send for VaapiEncoder {}

impl VaapiEncoder {
    /// Probe codecs and render devices, keeping the first working pair
    pub fn open(config: &EncoderConfig) -> Result<Self> {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = ffmpeg_next::init();
        });

        let devices = render_devices();
        if devices.is_empty() {
            warn!("No render devices found in /dev/dri");
            return Err(Error::NoEncoder);
        }

        info!(
            "Found {} render device(s), probing for encoder support...",
            devices.len()
        );

        for &codec in config.codec.candidates() {
            for device in &devices {
                debug!("Trying {} on {}...", codec.name(), device);
                match unsafe { try_open_on_device(device, codec, config) } {
                    Some(opened) => {
                        info!("Using {} encoder on {}", codec.name(), device);
                        return unsafe { Self::finish_open(opened, codec, config) };
                    }
                    None => continue,
                }
            }
        }

        Err(Error::NoEncoder)
    }

    unsafe fn finish_open(opened: OpenedContext, codec: Codec, config: &EncoderConfig) -> Result<Self> {
        let sw_frame = ffi::av_frame_alloc();
        (*sw_frame).format = ffi::AVPixelFormat::AV_PIX_FMT_NV12 as i32;
        (*sw_frame).width = config.width as i32;
        (*sw_frame).height = config.height as i32;
        let ret = ffi::av_frame_get_buffer(sw_frame, 32);
        if ret < 0 {
            return Err(Error::Encoder(format!("av_frame_get_buffer: {}", av_err(ret))));
        }

        let hw_frame = ffi::av_frame_alloc();
        let ret = ffi::av_hwframe_get_buffer(opened.hw_frames, hw_frame, 0);
        if ret < 0 {
            return Err(Error::Encoder(format!("av_hwframe_get_buffer: {}", av_err(ret))));
        }

        let packet = ffi::av_packet_alloc();

        info!(
            "VAAPI encoder initialized: {}x{} @ {} fps, {} bps, gop {}",
            config.width, config.height, config.framerate, config.bitrate, config.gop_size
        );

        Ok(Self {
            codec_ctx: opened.codec_ctx,
            hw_device: opened.hw_device,
            hw_frames: opened.hw_frames,
            sw_frame,
            hw_frame,
            packet,
            codec,
            width: config.width,
            height: config.height,
            bitrate: config.bitrate,
            frame_count: 0,
            force_keyframe: false,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Force the next encoded frame to be a keyframe. One-shot: the flag is
    /// cleared when a keyframe is actually produced.
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    /// Documented but not applied at runtime; a rate change requires
    /// reopening the encoder.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }

    /// Encode one frame. `Ok(None)` means the encoder needs more input
    /// before it can emit a packet.
    pub fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>> {
        if frame.width != self.width || frame.height != self.height {
            return Err(Error::Encoder(format!(
                "frame size {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        unsafe {
            let ret = ffi::av_frame_make_writable(self.sw_frame);
            if ret < 0 {
                return Err(Error::Encoder(format!("av_frame_make_writable: {}", av_err(ret))));
            }

            let height = self.height as usize;
            let y_stride = (*self.sw_frame).linesize[0] as usize;
            let uv_stride = (*self.sw_frame).linesize[1] as usize;
            let y_plane = std::slice::from_raw_parts_mut((*self.sw_frame).data[0], y_stride * height);
            let uv_plane =
                std::slice::from_raw_parts_mut((*self.sw_frame).data[1], uv_stride * height / 2);

            bgra_to_nv12(
                frame.data(),
                self.width as usize,
                height,
                frame.stride,
                y_plane,
                y_stride,
                uv_plane,
                uv_stride,
            );

            (*self.sw_frame).pts = self.frame_count;
            self.frame_count += 1;

            let ret = ffi::av_hwframe_transfer_data(self.hw_frame, self.sw_frame, 0);
            if ret < 0 {
                return Err(Error::Encoder(format!("GPU upload failed: {}", av_err(ret))));
            }
            (*self.hw_frame).pts = (*self.sw_frame).pts;

            if self.force_keyframe || (*self.sw_frame).pts == 0 {
                (*self.hw_frame).pict_type = ffi::AVPictureType::AV_PICTURE_TYPE_I;
                (*self.hw_frame).flags |= ffi::AV_FRAME_FLAG_KEY as i32;
            } else {
                (*self.hw_frame).pict_type = ffi::AVPictureType::AV_PICTURE_TYPE_NONE;
                (*self.hw_frame).flags &= !(ffi::AV_FRAME_FLAG_KEY as i32);
            }

            let ret = ffi::avcodec_send_frame(self.codec_ctx, self.hw_frame);
            if ret < 0 {
                return Err(Error::Encoder(format!("send frame failed: {}", av_err(ret))));
            }

            let ret = ffi::avcodec_receive_packet(self.codec_ctx, self.packet);
            if ret == averror(libc::EAGAIN) {
                return Ok(None);
            }
            if ret < 0 {
                return Err(Error::Encoder(format!("receive packet failed: {}", av_err(ret))));
            }

            let data = std::slice::from_raw_parts((*self.packet).data, (*self.packet).size as usize)
                .to_vec();
            let is_keyframe = (*self.packet).flags & ffi::AV_PKT_FLAG_KEY as i32 != 0;
            ffi::av_packet_unref(self.packet);

            if is_keyframe {
                self.force_keyframe = false;
            }

            Ok(Some(EncodedFrame {
                data,
                timestamp_us: frame.timestamp_us,
                is_keyframe,
            }))
        }
    }
}

impl Drop for VaapiEncoder {
    fn drop(&mut self) {
        unsafe {
            ffi::av_packet_free(&mut self.packet);
            ffi::av_frame_free(&mut self.hw_frame);
            ffi::av_frame_free(&mut self.sw_frame);
            ffi::avcodec_free_context(&mut self.codec_ctx);
            ffi::av_buffer_unref(&mut self.hw_frames);
            ffi::av_buffer_unref(&mut self.hw_device);
        }
    }
}

struct OpenedContext {
    codec_ctx: *mut ffi::AVCodecContext,
    hw_device: *mut ffi::AVBufferRef,
    hw_frames: *mut ffi::AVBufferRef,
}

/// Try to open one encoder on one device. Any failure unwinds the partial
/// state and reports None so the probe can move on.
unsafe fn try_open_on_device(device: &str, codec: Codec, config: &EncoderConfig) -> Option<OpenedContext> {
    let name = CString::new(encoder_name(codec)).ok()?;
    let av_codec = ffi::avcodec_find_encoder_by_name(name.as_ptr());
    if av_codec.is_null() {
        return None;
    }

    let device_c = CString::new(device).ok()?;
    let mut hw_device: *mut ffi::AVBufferRef = ptr::null_mut();
    let ret = ffi::av_hwdevice_ctx_create(
        &mut hw_device,
        ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
        device_c.as_ptr(),
        ptr::null_mut(),
        0,
    );
    if ret < 0 {
        return None;
    }

    let mut codec_ctx = ffi::avcodec_alloc_context3(av_codec);
    if codec_ctx.is_null() {
        ffi::av_buffer_unref(&mut hw_device);
        return None;
    }

    (*codec_ctx).width = config.width as i32;
    (*codec_ctx).height = config.height as i32;
    (*codec_ctx).time_base = ffi::AVRational { num: 1, den: config.framerate as i32 };
    (*codec_ctx).framerate = ffi::AVRational { num: config.framerate as i32, den: 1 };
    (*codec_ctx).pix_fmt = ffi::AVPixelFormat::AV_PIX_FMT_VAAPI;
    (*codec_ctx).gop_size = config.gop_size as i32;
    (*codec_ctx).max_b_frames = 0;
    (*codec_ctx).delay = 0;
    (*codec_ctx).thread_count = 1;

    apply_rate_control(codec_ctx, config);

    let opt = |key: &str, value: &str| {
        let k = CString::new(key).unwrap_or_default();
        let v = CString::new(value).unwrap_or_default();
        ffi::av_opt_set((*codec_ctx).priv_data, k.as_ptr(), v.as_ptr(), 0);
    };
    opt("tune", "zerolatency");
    opt("async_depth", "1");
    let idr = CString::new("idr_interval").unwrap_or_default();
    ffi::av_opt_set_int((*codec_ctx).priv_data, idr.as_ptr(), config.gop_size as i64, 0);

    let mut hw_frames = ffi::av_hwframe_ctx_alloc(hw_device);
    if hw_frames.is_null() {
        ffi::avcodec_free_context(&mut codec_ctx);
        ffi::av_buffer_unref(&mut hw_device);
        return None;
    }

    let frames_ctx = (*hw_frames).data as *mut ffi::AVHWFramesContext;
    (*frames_ctx).format = ffi::AVPixelFormat::AV_PIX_FMT_VAAPI;
    (*frames_ctx).sw_format = ffi::AVPixelFormat::AV_PIX_FMT_NV12;
    (*frames_ctx).width = config.width as i32;
    (*frames_ctx).height = config.height as i32;
    (*frames_ctx).initial_pool_size = 4;

    let ret = ffi::av_hwframe_ctx_init(hw_frames);
    if ret < 0 {
        ffi::av_buffer_unref(&mut hw_frames);
        ffi::avcodec_free_context(&mut codec_ctx);
        ffi::av_buffer_unref(&mut hw_device);
        return None;
    }

    (*codec_ctx).hw_frames_ctx = ffi::av_buffer_ref(hw_frames);

    // This is where we find out whether the device supports the codec
    let ret = ffi::avcodec_open2(codec_ctx, av_codec, ptr::null_mut());
    if ret < 0 {
        debug!("{} on {} refused: {}", encoder_name(codec), device, av_err(ret));
        ffi::av_buffer_unref(&mut hw_frames);
        ffi::avcodec_free_context(&mut codec_ctx);
        ffi::av_buffer_unref(&mut hw_device);
        return None;
    }

    Some(OpenedContext { codec_ctx, hw_device, hw_frames })
}

/// Rate control per quality mode: CBR with a one-frame buffer for the
/// latency modes, constant quantization with a rate cap otherwise.
unsafe fn apply_rate_control(codec_ctx: *mut ffi::AVCodecContext, config: &EncoderConfig) {
    let per_frame = (config.bitrate / config.framerate.max(1)) as i32;
    let rc_mode = CString::new("rc_mode").unwrap_or_default();
    let preset = CString::new("preset").unwrap_or_default();

    let set = |key: &CString, value: &str| {
        let v = CString::new(value).unwrap_or_default();
        ffi::av_opt_set((*codec_ctx).priv_data, key.as_ptr(), v.as_ptr(), 0);
    };

    match config.quality_mode {
        QualityMode::LowLatency | QualityMode::Balanced => {
            (*codec_ctx).bit_rate = config.bitrate as i64;
            (*codec_ctx).rc_max_rate = config.bitrate as i64;
            (*codec_ctx).rc_buffer_size = per_frame;
            set(&rc_mode, "CBR");
            set(&preset, "fast");
        }
        QualityMode::HighQuality => {
            (*codec_ctx).global_quality = config.cqp as i32;
            (*codec_ctx).rc_max_rate = config.bitrate as i64 * 2;
            (*codec_ctx).rc_buffer_size = per_frame * 2;
            set(&rc_mode, "CQP");
            set(&preset, "fast");
        }
        QualityMode::Auto => {
            (*codec_ctx).global_quality = config.cqp as i32;
            (*codec_ctx).rc_max_rate = config.bitrate as i64;
            (*codec_ctx).rc_buffer_size = per_frame * 4;
            set(&rc_mode, "CQP");
            set(&preset, if config.framerate > 90 { "faster" } else { "fast" });
        }
    }
}
