//! SlateCast Encoder - hardware video encoding
//!
//! Frames are encoded on the GPU through VAAPI. The codec family is chosen
//! by probing AV1, HEVC and H.264 (in that order of preference) on every
//! render device until one opens.

pub mod convert;
pub mod vaapi;

pub use vaapi::VaapiEncoder;
