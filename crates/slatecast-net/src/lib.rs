//! SlateCast Net - sockets and wire plumbing
//!
//! The control channel is TCP (optionally TLS) with length-prefixed
//! messages; video and audio leave as UDP datagrams; input events arrive as
//! a fixed-size record stream on their own TCP port. All per-session socket
//! work is nonblocking so the orchestrator's tick loop never stalls on the
//! network.

pub mod audio;
pub mod control;
pub mod input_stream;
pub mod tls;
pub mod video;

pub use audio::AudioSender;
pub use control::{ControlChannel, ControlEvent, ControlListener, ReceiverDescriptor};
pub use input_stream::InputListener;
pub use video::VideoSender;
