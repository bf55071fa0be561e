//! Virtual touchscreen with multitouch protocol type B slots

use crate::uinput::VirtualDevice;
use crate::{ABS_MAX, TOUCH_SLOTS};
use evdev::{AbsoluteAxisCode, EventType, InputEvent, KeyCode};
use slatecast_core::Result;
use tracing::debug;

/// Pure slot bookkeeping, separated from the device so the allocation
/// rules can be exercised without /dev/uinput.
#[derive(Debug)]
pub struct TouchSlots {
    active: [bool; TOUCH_SLOTS],
    /// Incoming pointer id -> slot index
    by_pointer: [Option<u8>; 256],
}

impl Default for TouchSlots {
    fn default() -> Self {
        TouchSlots {
            active: [false; TOUCH_SLOTS],
            by_pointer: [None; 256],
        }
    }
}

impl TouchSlots {
    /// Slot already holding this pointer, if any
    pub fn slot_of(&self, pointer_id: u8) -> Option<usize> {
        self.by_pointer[pointer_id as usize].map(|s| s as usize)
    }

    /// Allocate the first free slot for a new pointer
    pub fn allocate(&mut self, pointer_id: u8) -> Option<usize> {
        if let Some(slot) = self.slot_of(pointer_id) {
            return Some(slot);
        }
        let slot = self.active.iter().position(|&a| !a)?;
        self.active[slot] = true;
        self.by_pointer[pointer_id as usize] = Some(slot as u8);
        Some(slot)
    }

    /// Free the slot held by this pointer
    pub fn release(&mut self, pointer_id: u8) -> Option<usize> {
        let slot = self.by_pointer[pointer_id as usize].take()? as usize;
        self.active[slot] = false;
        Some(slot)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.active.iter().enumerate().filter(|(_, &a)| a).map(|(i, _)| i)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// BTN_TOOL_* key for a given finger count
fn tool_key(count: usize) -> Option<KeyCode> {
    match count {
        1 => Some(KeyCode::BTN_TOOL_FINGER),
        2 => Some(KeyCode::BTN_TOOL_DOUBLETAP),
        3 => Some(KeyCode::BTN_TOOL_TRIPLETAP),
        4 => Some(KeyCode::BTN_TOOL_QUADTAP),
        5 => Some(KeyCode::BTN_TOOL_QUINTTAP),
        _ => None,
    }
}

/// Virtual touchscreen device
pub struct VirtualTouch {
    device: VirtualDevice,
    screen_width: u32,
    screen_height: u32,
    slots: TouchSlots,
}

impl VirtualTouch {
    pub fn new(name: &str, screen_width: u32, screen_height: u32) -> Result<Self> {
        Ok(Self {
            device: VirtualDevice::new_touch(name)?,
            screen_width,
            screen_height,
            slots: TouchSlots::default(),
        })
    }

    pub fn slots(&self) -> &TouchSlots {
        &self.slots
    }

    fn scale(&self, x: i32, y: i32) -> (i32, i32) {
        (
            ((x as f32 / self.screen_width.max(1) as f32) * ABS_MAX as f32) as i32,
            ((y as f32 / self.screen_height.max(1) as f32) * ABS_MAX as f32) as i32,
        )
    }

    /// A finger touched down (or moved, if the pointer is already tracked)
    pub fn down(&mut self, pointer_id: u8, x: i32, y: i32, pressure: f32) -> Result<()> {
        let already_tracked = self.slots.slot_of(pointer_id).is_some();
        let Some(slot) = self.slots.allocate(pointer_id) else {
            debug!("No free touch slot for pointer {}", pointer_id);
            return Ok(());
        };

        let (abs_x, abs_y) = self.scale(x, y);
        let abs_pressure = (pressure.clamp(0.0, 1.0) * ABS_MAX as f32) as i32;

        let mut events = vec![InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_MT_SLOT.0,
            slot as i32,
        )];

        if !already_tracked {
            // Tracking id is the slot index
            events.push(InputEvent::new(
                EventType::ABSOLUTE.0,
                AbsoluteAxisCode::ABS_MT_TRACKING_ID.0,
                slot as i32,
            ));
            events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 1));

            let count = self.slots.active_count();
            if let Some(prev) = tool_key(count - 1) {
                events.push(InputEvent::new(EventType::KEY.0, prev.0, 0));
            }
            if let Some(tool) = tool_key(count) {
                events.push(InputEvent::new(EventType::KEY.0, tool.0, 1));
            }
        }

        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_MT_PRESSURE.0,
            abs_pressure,
        ));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_MT_POSITION_X.0,
            abs_x,
        ));
        events.push(InputEvent::new(
            EventType::ABSOLUTE.0,
            AbsoluteAxisCode::ABS_MT_POSITION_Y.0,
            abs_y,
        ));
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_X.0, abs_x));
        events.push(InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_Y.0, abs_y));
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.device.emit(&events)
    }

    /// A tracked finger moved
    pub fn moved(&mut self, pointer_id: u8, x: i32, y: i32, pressure: f32) -> Result<()> {
        self.down(pointer_id, x, y, pressure)
    }

    /// A finger lifted
    pub fn up(&mut self, pointer_id: u8) -> Result<()> {
        let count_before = self.slots.active_count();
        let Some(slot) = self.slots.release(pointer_id) else {
            debug!("TouchUp for unknown pointer {}", pointer_id);
            return Ok(());
        };

        let mut events = vec![
            InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_MT_SLOT.0, slot as i32),
            InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_MT_TRACKING_ID.0, -1),
        ];

        if self.slots.active_count() == 0 {
            events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 0));
        }
        if let Some(prev) = tool_key(count_before) {
            events.push(InputEvent::new(EventType::KEY.0, prev.0, 0));
        }

        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.device.emit(&events)
    }

    /// Release every active slot and all tool keys (session reset)
    pub fn reset(&mut self) -> Result<()> {
        let mut events = Vec::new();
        for slot in self.slots.active_slots() {
            events.push(InputEvent::new(
                EventType::ABSOLUTE.0,
                AbsoluteAxisCode::ABS_MT_SLOT.0,
                slot as i32,
            ));
            events.push(InputEvent::new(
                EventType::ABSOLUTE.0,
                AbsoluteAxisCode::ABS_MT_TRACKING_ID.0,
                -1,
            ));
        }
        events.push(InputEvent::new(EventType::KEY.0, KeyCode::BTN_TOUCH.0, 0));
        for count in 1..=TOUCH_SLOTS {
            if let Some(tool) = tool_key(count) {
                events.push(InputEvent::new(EventType::KEY.0, tool.0, 0));
            }
        }
        events.push(InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0));

        self.slots.clear();
        self.device.emit(&events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_allocates_first_free_slot() {
        let mut slots = TouchSlots::default();
        assert_eq!(slots.allocate(10), Some(0));
        assert_eq!(slots.allocate(20), Some(1));
        assert_eq!(slots.allocate(30), Some(2));
        assert_eq!(slots.active_count(), 3);
    }

    #[test]
    fn released_slot_is_reused() {
        let mut slots = TouchSlots::default();
        slots.allocate(1);
        slots.allocate(2);
        assert_eq!(slots.release(1), Some(0));
        assert_eq!(slots.allocate(3), Some(0));
        assert_eq!(slots.active_count(), 2);
    }

    #[test]
    fn slot_count_never_exceeds_five() {
        let mut slots = TouchSlots::default();
        for id in 0..TOUCH_SLOTS as u8 {
            assert!(slots.allocate(id).is_some());
        }
        assert_eq!(slots.allocate(99), None);
        assert_eq!(slots.active_count(), TOUCH_SLOTS);
    }

    #[test]
    fn repeated_down_for_same_pointer_keeps_its_slot() {
        let mut slots = TouchSlots::default();
        assert_eq!(slots.allocate(7), Some(0));
        assert_eq!(slots.allocate(7), Some(0));
        assert_eq!(slots.active_count(), 1);
    }

    #[test]
    fn active_set_matches_downs_without_ups() {
        // Invariant: active slots == downs not yet matched by an up
        let mut slots = TouchSlots::default();
        slots.allocate(1);
        slots.allocate(2);
        slots.allocate(3);
        slots.release(2);
        let active: Vec<usize> = slots.active_slots().collect();
        assert_eq!(active, vec![0, 2]);
    }

    #[test]
    fn release_of_unknown_pointer_is_ignored() {
        let mut slots = TouchSlots::default();
        assert_eq!(slots.release(42), None);
    }

    #[test]
    fn tool_keys_follow_finger_count() {
        assert_eq!(tool_key(1), Some(KeyCode::BTN_TOOL_FINGER));
        assert_eq!(tool_key(5), Some(KeyCode::BTN_TOOL_QUINTTAP));
        assert_eq!(tool_key(0), None);
        assert_eq!(tool_key(6), None);
    }
}
