//! Remote control channel: command/result records and the wire framing

pub mod types;
pub mod wire;
