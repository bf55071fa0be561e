//! Virtual uinput device creation

use crate::{ABS_MAX, TOUCH_SLOTS};
use evdev::{
    uinput::VirtualDevice as EvdevVirtualDevice, AbsInfo, AbsoluteAxisCode, AttributeSet,
    InputEvent, KeyCode, RelativeAxisCode, UinputAbsSetup,
};
use slatecast_core::{Error, Result};
use tracing::info;

/// Wrapper for an evdev virtual device
pub struct VirtualDevice {
    device: EvdevVirtualDevice,
    name: String,
}

impl VirtualDevice {
    /// Create the stylus tablet device: absolute position, pressure and
    /// tilt, with pen/rubber tool keys.
    pub fn new_stylus(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<KeyCode>::new();
        keys.insert(KeyCode::BTN_TOUCH);
        keys.insert(KeyCode::BTN_TOOL_PEN);
        keys.insert(KeyCode::BTN_TOOL_RUBBER);

        let pos_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 12);
        let pressure_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 12);
        let tilt_abs = AbsInfo::new(0, -90, 90, 0, 0, 12);

        let device = EvdevVirtualDevice::builder()
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .name(name)
            .with_keys(&keys)
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_X, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_Y, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_PRESSURE, pressure_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_TILT_X, tilt_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_TILT_Y, tilt_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .build()
            .map_err(|e| Error::UinputCreation(e.to_string()))?;

        info!("Created virtual stylus: {}", name);

        Ok(Self {
            device,
            name: name.to_string(),
        })
    }

    /// Create the absolute mouse device. Besides the three buttons it
    /// registers the whole keyboard key range (keyboard events from the
    /// receiver are relayed through this device) and scroll wheels.
    pub fn new_mouse(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<KeyCode>::new();
        keys.insert(KeyCode::BTN_LEFT);
        keys.insert(KeyCode::BTN_RIGHT);
        keys.insert(KeyCode::BTN_MIDDLE);
        // KEY_ESC..KEY_MICMUTE
        for code in 1..=248u16 {
            keys.insert(KeyCode::new(code));
        }

        let mut rel_axes = AttributeSet::<RelativeAxisCode>::new();
        rel_axes.insert(RelativeAxisCode::REL_WHEEL);
        rel_axes.insert(RelativeAxisCode::REL_HWHEEL);

        let pos_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 0);

        let device = EvdevVirtualDevice::builder()
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .name(name)
            .with_keys(&keys)
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_relative_axes(&rel_axes)
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_X, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_Y, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .build()
            .map_err(|e| Error::UinputCreation(e.to_string()))?;

        info!("Created virtual mouse: {}", name);

        Ok(Self {
            device,
            name: name.to_string(),
        })
    }

    /// Create the multitouch screen device with 5 slots
    pub fn new_touch(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<KeyCode>::new();
        keys.insert(KeyCode::BTN_TOUCH);
        keys.insert(KeyCode::BTN_TOOL_FINGER);
        keys.insert(KeyCode::BTN_TOOL_DOUBLETAP);
        keys.insert(KeyCode::BTN_TOOL_TRIPLETAP);
        keys.insert(KeyCode::BTN_TOOL_QUADTAP);
        keys.insert(KeyCode::BTN_TOOL_QUINTTAP);

        let pos_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 200);
        let pressure_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 0);
        let slot_abs = AbsInfo::new(0, 0, (TOUCH_SLOTS - 1) as i32, 0, 0, 0);
        let tracking_abs = AbsInfo::new(0, 0, ABS_MAX, 0, 0, 0);

        let device = EvdevVirtualDevice::builder()
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .name(name)
            .with_keys(&keys)
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_X, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_Y, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_MT_SLOT, slot_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_MT_TRACKING_ID, tracking_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_MT_POSITION_X, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_MT_POSITION_Y, pos_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_MT_PRESSURE, pressure_abs))
            .map_err(|e| Error::UinputCreation(e.to_string()))?
            .build()
            .map_err(|e| Error::UinputCreation(e.to_string()))?;

        info!("Created virtual touchscreen: {} ({} slots)", name, TOUCH_SLOTS);

        Ok(Self {
            device,
            name: name.to_string(),
        })
    }

    /// Emit input events followed by whatever synchronization the caller
    /// appended.
    pub fn emit(&mut self, events: &[InputEvent]) -> Result<()> {
        self.device
            .emit(events)
            .map_err(|e| Error::Input(e.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
