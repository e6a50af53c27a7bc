//! Drift core: SCSI target device emulation
//!
//! Emulates one or more SCSI target devices on a shared parallel bus. The
//! daemon crate drives the bus loop and the control channel; everything
//! SCSI lives here: the bus abstraction, the phase state machine, the
//! emulated device types, the track cache and the remote-command executor.

pub mod bus;
pub mod cache;
pub mod control;
pub mod controller;
pub mod device;
pub mod devinfo;
pub mod executor;
pub mod images;
pub mod props;
pub mod scsi;

/// Default TCP port of the control channel
pub const DEFAULT_CONTROL_PORT: u16 = 6868;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
