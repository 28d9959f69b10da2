use std::path::PathBuf;

/// Per-axis feed rates in mm/min, as accepted by the `speeds` startup
/// option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speeds {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Default for Speeds {
    fn default() -> Self {
        Self {
            x: 6000.0,
            y: 6000.0,
            z: 300.0,
            e: 200.0,
        }
    }
}

/// Construction-time configuration for a [`crate::Device`].
///
/// This intentionally has no notion of a config *file* or environment
/// variables — loading one of those onto a `Config` is the embedder's job,
/// not this crate's.
#[derive(Debug, Clone)]
pub struct Config {
    pub read_timeout: f64,
    pub write_timeout: f64,
    pub rx_buffer: usize,
    pub command_buffer: usize,
    pub extruders: usize,
    pub speeds: Speeds,
    /// `None` disables the auto-`wait` heartbeat; `Some(interval)` emits
    /// `wait` after `interval` seconds of silence on the line.
    pub wait: Option<f64>,
    pub ok_before: bool,
    pub support_m112: bool,
    pub support_f: bool,
    pub echo_m117: bool,
    /// Backing directory for the virtual SD card. Required if any SD
    /// command is expected to succeed; a missing directory just makes SD
    /// operations fail the way a missing card would.
    pub virtual_sd: PathBuf,
    pub throttle: f64,
    pub ok_with_lineno: bool,
    pub force_checksums: bool,
    pub repetier_resends: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: 5.0,
            write_timeout: 10.0,
            rx_buffer: 64,
            command_buffer: 4,
            extruders: 1,
            speeds: Speeds::default(),
            wait: None,
            ok_before: false,
            support_m112: true,
            support_f: true,
            echo_m117: true,
            virtual_sd: PathBuf::from("."),
            throttle: 0.1,
            ok_with_lineno: false,
            force_checksums: false,
            repetier_resends: false,
        }
    }
}
