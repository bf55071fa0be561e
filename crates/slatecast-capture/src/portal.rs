//! Wayland screen capture via the XDG desktop portal and PipeWire
//!
//! The portal handshake (CreateSession, SelectSources, Start) runs on a
//! dedicated thread with a small current-thread tokio runtime, then the same
//! thread drives a PipeWire main loop that copies each buffer into a shared
//! frame, normalized to BGRA with stride = width * 4.

use pipewire as pw;
use pw::spa;
use slatecast_core::{Error, RawFrame, Result};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Accepted pixel formats, all normalized to BGRA before emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Bgra,
    Bgrx,
    Rgbx,
    Rgba,
    Xbgr,
}

struct SharedFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    fresh: bool,
}

struct Shared {
    frame: Mutex<SharedFrame>,
    running: AtomicBool,
}

/// PipeWire screen capture negotiated through the desktop portal
pub struct PortalCapture {
    shared: Arc<Shared>,
    width: u32,
    height: u32,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PortalCapture {
    /// Request a screencast session and wait for the first negotiated format
    pub fn open() -> Result<Self> {
        info!("Requesting screen share via desktop portal...");

        let shared = Arc::new(Shared {
            frame: Mutex::new(SharedFrame {
                data: Vec::new(),
                width: 0,
                height: 0,
                fresh: false,
            }),
            running: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::spawn(move || {
            if let Err(e) = run_capture(thread_shared.clone()) {
                error!("Portal capture thread error: {}", e);
            }
            thread_shared.running.store(false, Ordering::SeqCst);
        });

        // The portal shows a dialog; wait for the user and the first frame
        let deadline = std::time::Instant::now() + Duration::from_secs(60);
        let (width, height) = loop {
            {
                let frame = shared
                    .frame
                    .lock()
                    .map_err(|_| Error::Portal("lock poisoned".into()))?;
                if frame.width > 0 && frame.height > 0 {
                    break (frame.width, frame.height);
                }
            }
            if !shared.running.load(Ordering::SeqCst) {
                return Err(Error::Portal("screen share was refused or failed".into()));
            }
            if std::time::Instant::now() > deadline {
                shared.running.store(false, Ordering::SeqCst);
                return Err(Error::Portal("timed out waiting for screen share".into()));
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        info!("Portal capture ready: {}x{}", width, height);

        Ok(Self {
            shared,
            width,
            height,
            thread: Some(thread),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Copy out the most recent frame. Dimensions may change between calls
    /// when the compositor resizes the stream.
    pub fn capture(&mut self) -> Result<Option<RawFrame>> {
        let mut frame = self
            .shared
            .frame
            .lock()
            .map_err(|_| Error::Capture("lock poisoned".into()))?;

        if frame.width == 0 || frame.data.is_empty() {
            return Ok(None);
        }

        if frame.width != self.width || frame.height != self.height {
            info!(
                "Capture dimensions changed: {}x{} -> {}x{}",
                self.width, self.height, frame.width, frame.height
            );
            self.width = frame.width;
            self.height = frame.height;
        }

        frame.fresh = false;
        let data = frame.data.clone();
        let (w, h) = (frame.width, frame.height);
        drop(frame);

        Ok(Some(RawFrame::new(data, w, h, (w * 4) as usize)))
    }
}

impl Drop for PortalCapture {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Portal handshake, then the PipeWire stream loop
fn run_capture(shared: Arc<Shared>) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
    use ashpd::desktop::PersistMode;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (fd, node_id) = rt.block_on(async {
        let proxy = Screencast::new().await?;
        let session = proxy.create_session().await?;

        proxy
            .select_sources(
                &session,
                CursorMode::Embedded,
                SourceType::Monitor.into(),
                false,
                None,
                PersistMode::DoNot,
            )
            .await?;

        let response = proxy.start(&session, None).await?.response()?;
        let streams = response.streams();
        if streams.is_empty() {
            return Err("no screen selected".into());
        }

        let node_id = streams[0].pipe_wire_node_id();
        let fd = proxy.open_pipe_wire_remote(&session).await?;

        info!("Screen share granted, node_id={}", node_id);

        Ok::<_, Box<dyn std::error::Error + Send + Sync>>((fd.into_raw_fd(), node_id))
    })?;

    run_pipewire(fd, node_id, shared)
}

#[derive(Default)]
struct StreamState {
    format: spa::param::video::VideoInfoRaw,
    have_format: bool,
}

fn run_pipewire(
    fd: i32,
    node_id: u32,
    shared: Arc<Shared>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None)?;
    let context = pw::context::Context::new(&mainloop)?;
    let core = context.connect_fd(unsafe { OwnedFd::from_raw_fd(fd) }, None)?;

    let stream = pw::stream::Stream::new(
        &core,
        "slatecast",
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )?;

    let process_shared = shared.clone();
    let _listener = stream
        .add_local_listener_with_user_data(StreamState::default())
        .state_changed(|_, _, old, new| {
            debug!("PipeWire stream state: {:?} -> {:?}", old, new);
        })
        .param_changed(|_, state, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            let (media_type, media_subtype) = match spa::param::format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };
            if media_type != spa::param::format::MediaType::Video
                || media_subtype != spa::param::format::MediaSubtype::Raw
            {
                return;
            }
            if state.format.parse(param).is_ok() {
                state.have_format = true;
                info!(
                    "Stream format negotiated: {:?} {}x{}",
                    state.format.format(),
                    state.format.size().width,
                    state.format.size().height
                );
            }
        })
        .process(move |stream, state| {
            if !state.have_format {
                return;
            }
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let width = state.format.size().width;
            let height = state.format.size().height;
            let layout = match pixel_layout(state.format.format()) {
                Some(layout) => layout,
                None => return,
            };

            let chunk = datas[0].chunk();
            let offset = chunk.offset() as usize;
            let size = chunk.size() as usize;
            let chunk_stride = chunk.stride() as usize;
            let src_stride = if chunk_stride > 0 {
                chunk_stride
            } else {
                (width * 4) as usize
            };

            let Some(slice) = datas[0].data() else { return };
            if size == 0 || offset + size > slice.len() {
                return;
            }
            let src = &slice[offset..offset + size];

            if let Ok(mut frame) = process_shared.frame.lock() {
                normalize_to_bgra(src, src_stride, width, height, layout, &mut frame.data);
                frame.width = width;
                frame.height = height;
                frame.fresh = true;
            }
        })
        .register()?;

    let obj = spa::pod::object!(
        spa::utils::SpaTypes::ObjectParamFormat,
        spa::param::ParamType::EnumFormat,
        spa::pod::property!(
            spa::param::format::FormatProperties::MediaType,
            Id,
            spa::param::format::MediaType::Video
        ),
        spa::pod::property!(
            spa::param::format::FormatProperties::MediaSubtype,
            Id,
            spa::param::format::MediaSubtype::Raw
        ),
        spa::pod::property!(
            spa::param::format::FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            spa::param::video::VideoFormat::BGRx,
            spa::param::video::VideoFormat::BGRx,
            spa::param::video::VideoFormat::BGRA,
            spa::param::video::VideoFormat::RGBx,
            spa::param::video::VideoFormat::RGBA,
            spa::param::video::VideoFormat::xBGR
        ),
        spa::pod::property!(
            spa::param::format::FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            spa::utils::Rectangle { width: 1920, height: 1080 },
            spa::utils::Rectangle { width: 1, height: 1 },
            spa::utils::Rectangle { width: 8192, height: 8192 }
        ),
        spa::pod::property!(
            spa::param::format::FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            spa::utils::Fraction { num: 60, denom: 1 },
            spa::utils::Fraction { num: 0, denom: 1 },
            spa::utils::Fraction { num: 1000, denom: 1 }
        )
    );
    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("failed to build format pod: {:?}", e))?
    .0
    .into_inner();
    let mut params = [spa::pod::Pod::from_bytes(&values).ok_or("invalid format pod")?];

    stream.connect(
        spa::utils::Direction::Input,
        Some(node_id),
        pw::stream::StreamFlags::AUTOCONNECT | pw::stream::StreamFlags::MAP_BUFFERS,
        &mut params,
    )?;

    info!("PipeWire stream connected, capturing...");

    while shared.running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(Duration::from_millis(16));
    }

    Ok(())
}

fn pixel_layout(format: spa::param::video::VideoFormat) -> Option<PixelLayout> {
    use spa::param::video::VideoFormat;
    match format {
        VideoFormat::BGRA => Some(PixelLayout::Bgra),
        VideoFormat::BGRx => Some(PixelLayout::Bgrx),
        VideoFormat::RGBx => Some(PixelLayout::Rgbx),
        VideoFormat::RGBA => Some(PixelLayout::Rgba),
        VideoFormat::xBGR => Some(PixelLayout::Xbgr),
        _ => None,
    }
}

/// Repack a possibly-padded source buffer into tight BGRA rows
fn normalize_to_bgra(
    src: &[u8],
    src_stride: usize,
    width: u32,
    height: u32,
    layout: PixelLayout,
    dst: &mut Vec<u8>,
) {
    let row_bytes = (width * 4) as usize;
    dst.resize(row_bytes * height as usize, 0);

    for y in 0..height as usize {
        let src_off = y * src_stride;
        if src_off + row_bytes > src.len() {
            break;
        }
        let src_row = &src[src_off..src_off + row_bytes];
        let dst_row = &mut dst[y * row_bytes..(y + 1) * row_bytes];

        match layout {
            PixelLayout::Bgra | PixelLayout::Bgrx => {
                dst_row.copy_from_slice(src_row);
            }
            PixelLayout::Rgbx | PixelLayout::Rgba => {
                for x in 0..width as usize {
                    let i = x * 4;
                    dst_row[i] = src_row[i + 2];
                    dst_row[i + 1] = src_row[i + 1];
                    dst_row[i + 2] = src_row[i];
                    dst_row[i + 3] = 255;
                }
            }
            PixelLayout::Xbgr => {
                for x in 0..width as usize {
                    let i = x * 4;
                    dst_row[i] = src_row[i + 1];
                    dst_row[i + 1] = src_row[i + 2];
                    dst_row[i + 2] = src_row[i + 3];
                    dst_row[i + 3] = 255;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_rows_are_swapped_to_bgra() {
        // One 2x1 frame: red pixel, then blue pixel
        let src = [255, 0, 0, 255, 0, 0, 255, 255];
        let mut dst = Vec::new();
        normalize_to_bgra(&src, 8, 2, 1, PixelLayout::Rgba, &mut dst);
        assert_eq!(dst, vec![0, 0, 255, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn padded_stride_is_repacked() {
        // 1x2 frame with 8-byte rows, 4 bytes padding each
        let src = [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0];
        let mut dst = Vec::new();
        normalize_to_bgra(&src, 8, 1, 2, PixelLayout::Bgra, &mut dst);
        assert_eq!(dst, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn xbgr_maps_channels() {
        let src = [9, 10, 20, 30];
        let mut dst = Vec::new();
        normalize_to_bgra(&src, 4, 1, 1, PixelLayout::Xbgr, &mut dst);
        assert_eq!(dst, vec![10, 20, 30, 255]);
    }
}
