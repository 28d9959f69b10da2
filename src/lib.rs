//! An emulated Marlin/RepRap printer firmware speaking the serial G-code
//! protocol, for host-side controller development without hardware.
//!
//! The device accepts a byte stream of newline-terminated G-code on one
//! side and produces a byte stream of firmware responses on the other,
//! while simulating extruder/bed temperatures, print-head position, a
//! virtual SD card, and the line-number/checksum handshake a real
//! controller relies on.
//!
//! ```no_run
//! use virtual_marlin::{Config, Device, DiskFilesystem};
//!
//! let device = Device::new(
//!     Config::default(),
//!     Box::new(DiskFilesystem::new("./virtual_sd")),
//!     || "VirtualMarlin 1.0".to_string(),
//! );
//! device.write("N1 M110*0\n").unwrap();
//! println!("{}", device.read().unwrap());
//! ```

mod channel;
mod config;
mod debug;
mod device;
mod dispatch;
mod error;
mod gcode;
mod motion;
mod protocol;
mod queue;
mod sd;
mod thermal;

pub use config::{Config, Speeds};
pub use device::Device;
pub use error::{Error, QueueError, Result};
pub use sd::{DiskFilesystem, Filesystem};
