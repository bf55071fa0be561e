//! SlateCast Input - uinput-based input injection
//!
//! Three synthetic devices are created per process: a stylus tablet, an
//! absolute mouse (which also relays keyboard keys and scroll), and a
//! 5-slot multitouch screen. Incoming wire events are transformed from
//! normalized tablet coordinates and dispatched here.

pub mod mouse;
pub mod relay;
pub mod stylus;
pub mod touch;
pub mod transform;
pub mod uinput;

pub use relay::InputRelay;
pub use transform::CoordTransform;

/// Maximum value of the absolute X/Y/pressure axes on all three devices
pub const ABS_MAX: i32 = 65535;

/// Number of multitouch slots on the touch device
pub const TOUCH_SLOTS: usize = 5;
