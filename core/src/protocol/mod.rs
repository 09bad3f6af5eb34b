//! Wire formats: heartbeat frames and data packages

pub mod constants;
mod heartbeat;
mod package;

pub use heartbeat::{decode_heartbeat, encode_heartbeat, HeartbeatCommand, HeartbeatFrame, InvalidFrame};
pub use package::{DataPackage, ImageAttachment};
