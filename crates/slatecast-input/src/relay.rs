//! Input relay: wire events in, kernel events out
//!
//! Owns the three synthetic devices and the per-session coordinate
//! transform. When the devices cannot be created (no /dev/uinput access)
//! the relay stays inactive: events are accepted and discarded, and the
//! video pipeline is unaffected.

use crate::mouse::VirtualMouse;
use crate::stylus::VirtualStylus;
use crate::touch::VirtualTouch;
use crate::transform::CoordTransform;
use slatecast_core::protocol::{InputEvent, InputEventKind};
use slatecast_core::{Result, ScaleMode};
use tracing::{debug, warn};

// Field order is drop order: devices are destroyed in reverse creation
// order (touch, mouse, stylus).
struct Devices {
    touch: VirtualTouch,
    mouse: VirtualMouse,
    stylus: VirtualStylus,
}

pub struct InputRelay {
    devices: Option<Devices>,
    transform: CoordTransform,
}

impl InputRelay {
    /// Create the synthetic devices. Creation failure leaves the relay
    /// inactive rather than failing the server.
    pub fn new(screen_width: u32, screen_height: u32) -> Self {
        let devices = Self::create_devices(screen_width, screen_height);
        if devices.is_none() {
            warn!("Could not create uinput devices; input injection disabled (is /dev/uinput accessible?)");
        }

        Self {
            devices,
            transform: CoordTransform::identity(screen_width, screen_height),
        }
    }

    fn create_devices(screen_width: u32, screen_height: u32) -> Option<Devices> {
        let stylus = VirtualStylus::new("SlateCast Stylus", screen_width, screen_height).ok()?;
        let mouse = VirtualMouse::new("SlateCast Mouse").ok()?;
        let touch = VirtualTouch::new("SlateCast Touch", screen_width, screen_height).ok()?;
        Some(Devices { touch, mouse, stylus })
    }

    pub fn is_active(&self) -> bool {
        self.devices.is_some()
    }

    /// Install the per-session transform from the receiver's advertised size
    pub fn configure(
        &mut self,
        screen_width: u32,
        screen_height: u32,
        tablet_width: u32,
        tablet_height: u32,
    ) {
        self.transform = CoordTransform::new(
            screen_width,
            screen_height,
            tablet_width.max(1),
            tablet_height.max(1),
            ScaleMode::Letterbox,
            false,
        );
    }

    /// Dispatch one wire event to the matching device
    pub fn dispatch(&mut self, event: &InputEvent) -> Result<()> {
        let Some(devices) = self.devices.as_mut() else {
            return Ok(());
        };

        let (sx, sy) = self.transform.to_screen(event.x, event.y);

        match event.kind {
            InputEventKind::StylusHover => {
                devices.stylus.hover(sx, sy, event.tilt_x, event.tilt_y, event.eraser())
            }
            InputEventKind::StylusDown | InputEventKind::StylusMove => devices.stylus.contact(
                sx,
                sy,
                event.pressure,
                event.tilt_x,
                event.tilt_y,
                event.eraser(),
            ),
            InputEventKind::StylusUp => devices.stylus.leave(),
            InputEventKind::TouchDown => devices.touch.down(event.pointer_id, sx, sy, event.pressure),
            InputEventKind::TouchMove => devices.touch.moved(event.pointer_id, sx, sy, event.pressure),
            InputEventKind::TouchUp => devices.touch.up(event.pointer_id),
            InputEventKind::KeyDown => devices.mouse.key(event.buttons, true),
            InputEventKind::KeyUp => devices.mouse.key(event.buttons, false),
            InputEventKind::Scroll => devices.mouse.scroll(event.x, event.y),
        }
    }

    /// Release every pressed key, free every slot and return the stylus to
    /// out-of-range. Called on session end and shutdown.
    pub fn reset_all(&mut self) {
        let Some(devices) = self.devices.as_mut() else {
            return;
        };
        debug!("Resetting all input state");
        if let Err(e) = devices.stylus.reset() {
            warn!("Stylus reset failed: {}", e);
        }
        if let Err(e) = devices.mouse.reset() {
            warn!("Mouse reset failed: {}", e);
        }
        if let Err(e) = devices.touch.reset() {
            warn!("Touch reset failed: {}", e);
        }
    }
}

impl Drop for InputRelay {
    fn drop(&mut self) {
        self.reset_all();
    }
}
