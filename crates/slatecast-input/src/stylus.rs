//! Virtual stylus with pressure, tilt and eraser support

use crate::uinput::VirtualDevice;
use crate::ABS_MAX;
use evdev::{AbsoluteAxisCode, EventType, InputEvent, KeyCode};
use slatecast_core::Result;
use tracing::debug;

/// Proximity state of the pen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StylusState {
    #[default]
    OutOfRange,
    Hovering,
    Touching,
}

/// Virtual stylus device and its state machine.
///
/// Invariant: `Touching` implies the tool key is active; leaving proximity
/// releases the tool and zeroes pressure.
pub struct VirtualStylus {
    device: VirtualDevice,
    screen_width: u32,
    screen_height: u32,
    state: StylusState,
    eraser_active: bool,
    tool_active: bool,
}

impl VirtualStylus {
    pub fn new(name: &str, screen_width: u32, screen_height: u32) -> Result<Self> {
        Ok(Self {
            device: VirtualDevice::new_stylus(name)?,
            screen_width,
            screen_height,
            state: StylusState::OutOfRange,
            eraser_active: false,
            tool_active: false,
        })
    }

    pub fn state(&self) -> StylusState {
        self.state
    }

    fn scale(&self, x: i32, y: i32) -> (i32, i32) {
        (
            ((x as f32 / self.screen_width.max(1) as f32) * ABS_MAX as f32) as i32,
            ((y as f32 / self.screen_height.max(1) as f32) * ABS_MAX as f32) as i32,
        )
    }

    fn tool_key(&self) -> KeyCode {
        if self.eraser_active {
            KeyCode::BTN_TOOL_RUBBER
        } else {
            KeyCode::BTN_TOOL_PEN
        }
    }

    /// Switch between pen and rubber, releasing the previous tool key
    fn select_tool(&mut self, eraser: bool, events: &mut Vec<InputEvent>) {
        if self.tool_active && eraser != self.eraser_active {
            events.push(InputEvent::new(EventType::KEY.0, self.tool_key().0, 0));
            self.tool_active = false;
        }
        self.eraser_active = eraser;
        if !self.tool_active {
            events.push(InputEvent::new(EventType::KEY.0, self.tool_key().0, 1));
            self.tool_active = true;
        }
    }

    /// Pen in range but not touching: position and tilt with zero pressure
    pub fn hover(&mut self, x: i32, y: i32, tilt_x: f32, tilt_y: f32, eraser: bool) -> Result<()> {
        let (abs_x, abs_y) = self.scale(x, y);
        let mut events = Vec::new();

        self.select_tool(eraser, &mut events);

        if self.state == StylusState::Touching {
            events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 0));
        }
        self.state = StylusState::Hovering;

        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_X.0, abs_x));
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_Y.0, abs_y));
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_PRESSURE.0, 0));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_TILT_X.0,
            tilt_deg(tilt_x),
        ));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_TILT_Y.0,
            tilt_deg(tilt_y),
        ));
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.device.emit(&events)
    }

    /// Pen tip pressed against the surface
    pub fn contact(
        &mut self,
        x: i32,
        y: i32,
        pressure: f32,
        tilt_x: f32,
        tilt_y: f32,
        eraser: bool,
    ) -> Result<()> {
        let (abs_x, abs_y) = self.scale(x, y);
        let abs_pressure = (pressure.clamp(0.0, 1.0) * ABS_MAX as f32) as i32;
        let mut events = Vec::new();

        self.select_tool(eraser, &mut events);

        if self.state != StylusState::Touching {
            events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 1));
            self.state = StylusState::Touching;
        }

        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_X.0, abs_x));
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_Y.0, abs_y));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_PRESSURE.0,
            abs_pressure,
        ));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_TILT_X.0,
            tilt_deg(tilt_x),
        ));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_TILT_Y.0,
            tilt_deg(tilt_y),
        ));
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.device.emit(&events)
    }

    /// Pen left proximity: release touch and tool, zero pressure
    pub fn leave(&mut self) -> Result<()> {
        if self.state == StylusState::OutOfRange && !self.tool_active {
            return Ok(());
        }

        debug!("Stylus leaving range");

        let mut events = Vec::new();
        if self.state == StylusState::Touching {
            events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 0));
        }
        if self.tool_active {
            events.push(InputEvent::new(EventType::KEY.0, self.tool_key().0, 0));
            self.tool_active = false;
        }
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_PRESSURE.0, 0));
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.state = StylusState::OutOfRange;
        self.eraser_active = false;
        self.device.emit(&events)
    }

    /// Release everything unconditionally (session reset)
    pub fn reset(&mut self) -> Result<()> {
        let events = [
            InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 0),
            InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOOL_PEN.0, 0),
            InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOOL_RUBBER.0, 0),
            InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_PRESSURE.0, 0),
            InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0),
        ];
        self.state = StylusState::OutOfRange;
        self.eraser_active = false;
        self.tool_active = false;
        self.device.emit(&events)
    }
}

/// Wire tilt is in radians; the device axis is degrees
fn tilt_deg(radians: f32) -> i32 {
    (radians.to_degrees().clamp(-90.0, 90.0)) as i32
}
