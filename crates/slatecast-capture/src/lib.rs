//! SlateCast Capture - screen capture backends
//!
//! Two concrete sources exist: X11 (MIT-SHM pixmap reads of the root
//! window) and the desktop portal (ScreenCast + PipeWire). `Capture` wraps
//! whichever variant opened so the pipeline calls one `capture()` either way.

pub mod portal;
pub mod x11;

use slatecast_core::{CaptureBackend, Error, RawFrame, Result};
use tracing::{info, warn};

pub use portal::PortalCapture;
pub use x11::X11Capture;

/// A capture source, one of the two concrete backends
pub enum Capture {
    X11(X11Capture),
    Portal(PortalCapture),
}

impl Capture {
    /// Open a capture source, honoring the backend selection and falling
    /// back to the other variant when the preferred one fails to open.
    pub fn open(backend: CaptureBackend, display: &str) -> Result<Self> {
        match backend {
            CaptureBackend::X11 => Ok(Capture::X11(X11Capture::open(display)?)),
            CaptureBackend::Portal => Ok(Capture::Portal(PortalCapture::open()?)),
            CaptureBackend::Auto => {
                if wayland_session() {
                    match PortalCapture::open() {
                        Ok(portal) => Ok(Capture::Portal(portal)),
                        Err(e) => {
                            warn!("Portal capture failed ({}), falling back to X11", e);
                            Ok(Capture::X11(X11Capture::open(display)?))
                        }
                    }
                } else {
                    match X11Capture::open(display) {
                        Ok(x11) => Ok(Capture::X11(x11)),
                        Err(e) => {
                            warn!("X11 capture failed ({}), falling back to portal", e);
                            Ok(Capture::Portal(PortalCapture::open()?))
                        }
                    }
                }
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Capture::X11(_) => "x11",
            Capture::Portal(_) => "portal",
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Capture::X11(c) => c.width(),
            Capture::Portal(c) => c.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Capture::X11(c) => c.height(),
            Capture::Portal(c) => c.height(),
        }
    }

    /// Grab the next frame. `Ok(None)` means nothing is ready yet and the
    /// caller should retry on the next tick.
    pub fn capture(&mut self) -> Result<Option<RawFrame>> {
        match self {
            Capture::X11(c) => c.capture(),
            Capture::Portal(c) => c.capture(),
        }
    }
}

/// True when the environment indicates a Wayland compositor session
fn wayland_session() -> bool {
    if std::env::var("XDG_SESSION_TYPE").map(|v| v == "wayland").unwrap_or(false) {
        return true;
    }
    std::env::var_os("WAYLAND_DISPLAY").is_some()
}

/// Open with logging of the selected backend
pub fn open_capture(backend: CaptureBackend, display: &str) -> Result<Capture> {
    let capture = Capture::open(backend, display)?;
    info!(
        "Capture source ready: {} ({}x{})",
        capture.backend_name(),
        capture.width(),
        capture.height()
    );
    if capture.width() == 0 || capture.height() == 0 {
        return Err(Error::Capture("capture source reported zero size".into()));
    }
    Ok(capture)
}
