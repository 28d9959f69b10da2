//! Demo binary: runs a `Device` over stdin/stdout so it can be driven like a
//! real serial port from a shell or a host controller's test harness.

use std::io::{self, BufRead, Write};

use clap::Parser;
use virtual_marlin::{Config, Device, DiskFilesystem};

#[derive(Parser)]
#[command(name = "virtual_marlind", about = "Emulated Marlin firmware over stdio")]
struct Args {
    /// Backing directory for the virtual SD card.
    #[arg(long, default_value = ".")]
    virtual_sd: std::path::PathBuf,

    #[arg(long, default_value_t = 64)]
    rx_buffer: usize,

    #[arg(long, default_value_t = 4)]
    command_buffer: usize,

    #[arg(long, default_value_t = 1)]
    extruders: usize,

    #[arg(long)]
    ok_before: bool,

    #[arg(long)]
    ok_with_lineno: bool,

    #[arg(long)]
    force_checksums: bool,

    #[arg(long)]
    repetier_resends: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = Config {
        virtual_sd: args.virtual_sd.clone(),
        rx_buffer: args.rx_buffer,
        command_buffer: args.command_buffer,
        extruders: args.extruders,
        ok_before: args.ok_before,
        ok_with_lineno: args.ok_with_lineno,
        force_checksums: args.force_checksums,
        repetier_resends: args.repetier_resends,
        ..Config::default()
    };

    if let Err(e) = std::fs::create_dir_all(&args.virtual_sd) {
        log::warn!("failed to create virtual SD directory {:?}: {}", args.virtual_sd, e);
    }

    let device = Device::new(
        config,
        Box::new(DiskFilesystem::new(args.virtual_sd)),
        || env!("CARGO_PKG_VERSION").to_string(),
    );

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let mut line = line;
                line.push('\n');
                if device.write(&line).is_err() {
                    break;
                }
            }
        });

        let stdout = io::stdout();
        loop {
            match device.read() {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => {
                    let mut out = stdout.lock();
                    if out.write_all(line.as_bytes()).is_err() {
                        break;
                    }
                    let _ = out.flush();
                }
                Err(_) => break,
            }
        }
    });
}
