//! Virtual mouse: absolute pointer, keyboard relay and scroll wheel

use crate::uinput::VirtualDevice;
use evdev::{EventType, InputEvent, KeyCode, RelativeAxisCode};
use slatecast_core::Result;
use tracing::debug;

pub struct VirtualMouse {
    device: VirtualDevice,
    pressed_keys: Vec<u16>,
}

impl VirtualMouse {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            device: VirtualDevice::new_mouse(name)?,
            pressed_keys: Vec::new(),
        })
    }

    /// Relay a keyboard key. `code` is a Linux key code as carried in the
    /// buttons field of the wire record.
    pub fn key(&mut self, code: u16, pressed: bool) -> Result<()> {
        debug!("Key {} {}", code, if pressed { "down" } else { "up" });

        if pressed {
            if !self.pressed_keys.contains(&code) {
                self.pressed_keys.push(code);
            }
        } else {
            self.pressed_keys.retain(|&c| c != code);
        }

        let events = [
            InputEvent::new(EventType::KEY.0, code, if pressed { 1 } else { 0 }),
            InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0),
        ];
        self.device.emit(&events)
    }

    /// Emit scroll wheel clicks. Deltas arrive in wheel steps; vertical is
    /// inverted to match natural direction on the desktop.
    pub fn scroll(&mut self, dx: f32, dy: f32) -> Result<()> {
        let scroll_x = dx as i32;
        let scroll_y = -(dy as i32);
        if scroll_x == 0 && scroll_y == 0 {
            return Ok(());
        }

        let mut events = Vec::new();
        if scroll_y != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE.0,
                RelativeAxisCode::REL_WHEEL.0,
                scroll_y,
            ));
        }
        if scroll_x != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE.0,
                RelativeAxisCode::REL_HWHEEL.0,
                scroll_x,
            ));
        }
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.device.emit(&events)
    }

    /// Release every key this device still holds down (session reset)
    pub fn reset(&mut self) -> Result<()> {
        let mut events = Vec::new();
        for &code in &self.pressed_keys {
            events.push(InputEvent::new(EventType::KEY.0, code, 0));
        }
        events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_LEFT.0, 0));
        events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_RIGHT.0, 0));
        events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_MIDDLE.0, 0));
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.pressed_keys.clear();
        self.device.emit(&events)
    }
}
