//! The lifecycle supervisor: the shared state bundle every worker touches,
//! and the `Device` handle a host actually holds.
//!
//! A `Device` owns two always-on worker threads (the line-protocol reader
//! and the move-queue consumer); the SD printer and the blocking heat-up
//! wait are spawned/invoked on demand from inside command dispatch.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::channel;
use crate::config::Config;
use crate::debug::{self, DebugState};
use crate::dispatch::{self, Heater};
use crate::error::Error;
use crate::error::QueueError;
use crate::gcode;
use crate::motion::MotionState;
use crate::protocol::{self, ProtocolState};
use crate::queue::BoundedQueue;
use crate::sd::{self, Filesystem, SdState};
use crate::thermal::ThermalState;

/// Everything a worker thread needs, bundled behind an `Arc` so reader,
/// mover, SD-printer, and heat-up-waiter can each hold a clone.
pub(crate) struct Shared {
    pub config: Config,
    pub rx: BoundedQueue<String>,
    pub tx: BoundedQueue<String>,
    pub move_queue: BoundedQueue<String>,
    pub protocol: Mutex<ProtocolState>,
    pub motion: Mutex<MotionState>,
    pub thermal: Mutex<ThermalState>,
    pub sd: Mutex<SdState>,
    pub sd_gate: sd::Gate,
    pub debug: Mutex<DebugState>,
    pub fs: Box<dyn Filesystem>,
    pub version: Box<dyn Fn() -> String + Send + Sync>,
    pub drop_connection: AtomicBool,
    /// Unifies "close" and "kill": every blocking wait (queue gets, move
    /// duration slices, heat-up polling, the SD pause gate) rechecks this
    /// between steps, so either shutdown path drains workers the same way.
    pub stopped: AtomicBool,
    pub move_in_flight: AtomicBool,
    pub active_extruder: AtomicUsize,
    pub last_input_at: Mutex<Instant>,
}

static LEADING_N_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^N\d+\s*").unwrap());

fn strip_leading_n(payload: &str) -> &str {
    match LEADING_N_RE.find(payload) {
        Some(m) => &payload[m.end()..],
        None => payload,
    }
}

/// The emulated printer. Construct one per simulated serial connection.
pub struct Device {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    mover: Option<JoinHandle<()>>,
}

impl Device {
    /// Builds the device, emits the boot banner onto the response queue, and
    /// starts the reader and move-queue workers. `version` supplies the
    /// opaque string returned for the `version` meta-command.
    pub fn new(
        config: Config,
        filesystem: Box<dyn Filesystem>,
        version: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        let rx = BoundedQueue::new(config.rx_buffer, str::len);
        let tx = BoundedQueue::unbounded();
        let move_queue = BoundedQueue::new(config.command_buffer, |_| 1);
        let motion = MotionState::new(config.speeds);
        let thermal = ThermalState::new(config.extruders);

        let shared = Arc::new(Shared {
            rx,
            tx,
            move_queue,
            protocol: Mutex::new(ProtocolState::default()),
            motion: Mutex::new(motion),
            thermal: Mutex::new(thermal),
            sd: Mutex::new(SdState::default()),
            sd_gate: sd::Gate::default(),
            debug: Mutex::new(DebugState::default()),
            fs: filesystem,
            version: Box::new(version),
            drop_connection: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            move_in_flight: AtomicBool::new(false),
            active_extruder: AtomicUsize::new(0),
            last_input_at: Mutex::new(Instant::now()),
            config,
        });

        shared.sd_gate.set();
        for line in ["start", "Marlin: Virtual Marlin!", "\u{80}", "SD card ok"] {
            shared.tx.put(line.to_string(), true, None).ok();
        }

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::spawn(move || reader_loop(reader_shared));

        let mover_shared = Arc::clone(&shared);
        let mover = std::thread::spawn(move || move_worker(mover_shared));

        Device {
            shared,
            reader: Some(reader),
            mover: Some(mover),
        }
    }

    /// Enqueues `data` for the reader to consume. Fails with
    /// [`Error::Timeout`] if the connection has been dropped or `rx` refuses
    /// the write within `write_timeout`.
    pub fn write(&self, data: &str) -> Result<(), Error> {
        let shared = &self.shared;
        channel::write(
            &shared.rx,
            &shared.drop_connection,
            shared.config.write_timeout,
            shared.config.support_m112,
            data,
            || {
                log::warn!("M112 received, emergency stop");
                shared.stopped.store(true, Ordering::SeqCst);
                shared
                    .tx
                    .put(
                        "echo:EMERGENCY SHUTDOWN DETECTED. KILLED.".to_string(),
                        true,
                        None,
                    )
                    .ok();
            },
        )
    }

    /// Dequeues and returns the next response line (newline-terminated), or
    /// an empty string if none arrives within `read_timeout`.
    pub fn read(&self) -> Result<String, Error> {
        channel::read(
            &self.shared.tx,
            &self.shared.drop_connection,
            self.shared.config.read_timeout,
            self.shared.config.throttle,
        )
    }

    /// Alias for [`Device::read`]: both dequeue one response line.
    pub fn readline(&self) -> Result<String, Error> {
        self.read()
    }

    /// Tears down the queues; workers observe this on their next check and
    /// exit. Non-blocking — drop the `Device` (or call this then let it
    /// drop) to join the worker threads.
    pub fn close(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.rx.close();
        self.shared.tx.close();
        self.shared.move_queue.close();
        self.shared.sd_gate.set();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.mover.take() {
            let _ = h.join();
        }
    }
}

fn push_all(shared: &Arc<Shared>, lines: Vec<String>) {
    for line in lines {
        shared.tx.put(line, true, None).ok();
    }
}

fn ok_line(shared: &Arc<Shared>) -> String {
    if shared.config.ok_with_lineno {
        format!("ok {}", shared.protocol.lock().unwrap().last_n)
    } else {
        "ok".to_string()
    }
}

fn reader_loop(shared: Arc<Shared>) {
    let mut buffer = String::new();

    while !shared.stopped.load(Ordering::SeqCst) {
        shared.thermal.lock().unwrap().tick();

        match shared.rx.get(Duration::from_millis(10)) {
            Ok(chunk) => {
                *shared.last_input_at.lock().unwrap() = Instant::now();
                buffer.push_str(&chunk);
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if debug::take_dont_answer(&shared.debug) {
                        continue;
                    }
                    process_line(&shared, &line);
                    if shared.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
            Err(QueueError::Closed) => break,
            Err(QueueError::Empty) => {
                if let Some(interval) = shared.config.wait {
                    let mut last = shared.last_input_at.lock().unwrap();
                    if last.elapsed().as_secs_f64() >= interval {
                        shared.tx.put("wait".to_string(), true, None).ok();
                        *last = Instant::now();
                    }
                }
            }
            Err(_) => {}
        }
    }
}

fn process_line(shared: &Arc<Shared>, raw_line: &str) {
    let trimmed = raw_line.trim_end();
    if trimmed.is_empty() {
        return;
    }

    let (payload, had_checksum) = match protocol::strip_checksum(trimmed) {
        Some(p) => (p.to_string(), true),
        None => (trimmed.to_string(), false),
    };

    if had_checksum {
        shared.protocol.lock().unwrap().current_line += 1;
    } else if shared.config.force_checksums {
        push_all(shared, vec!["Error: Missing checksum".to_string()]);
        return;
    }

    let current_line = shared.protocol.lock().unwrap().current_line;
    let mut command_text = payload.clone();

    if let Some(n) = gcode::parse_line_number(&payload) {
        let stripped = strip_leading_n(&payload);

        if gcode::parse_command(stripped).map_or(false, |c| c.letter == 'M' && c.number == 110) {
            let mut protocol = shared.protocol.lock().unwrap();
            protocol.last_n = n;
            protocol.current_line = n;
            drop(protocol);
            push_all(shared, vec![ok_line(shared)]);
            return;
        }

        let expected = shared.protocol.lock().unwrap().last_n + 1;
        if n != expected {
            let lines = protocol::trigger_resend(
                &shared.protocol,
                shared.config.repetier_resends,
                None,
                Some(n),
            );
            push_all(shared, lines);
            return;
        }

        // Fires once per boot at this threshold, only when the line number
        // otherwise matched: a fixed test hook that exercises the host's
        // resend path on a schedule rather than in response to a real gap.
        if current_line == 101 {
            let lines = protocol::trigger_resend(
                &shared.protocol,
                shared.config.repetier_resends,
                Some(100),
                None,
            );
            push_all(shared, lines);
            return;
        }

        shared.protocol.lock().unwrap().last_n = n;
        command_text = stripped.to_string();
    }

    let (writing_to_sd, selected_file) = {
        let sd_state = shared.sd.lock().unwrap();
        (sd_state.writing_to_sd, sd_state.selected_file.clone())
    };
    if writing_to_sd {
        if let Some(name) = selected_file {
            let is_m29 = gcode::parse_command(&command_text).map_or(false, |c| c.token() == "M29");
            if !is_m29 {
                append_sd_write_line(shared, &name, &command_text);
                push_all(shared, vec!["ok".to_string()]);
                return;
            }
        }
    }

    if command_text.trim() == "version" {
        push_all(shared, vec![(shared.version)()]);
        return;
    }

    if let Some(rest) = command_text.trim_start().strip_prefix("!!DEBUG") {
        let rest = rest.strip_prefix(':').unwrap_or(rest).trim();
        let trigger = |expected: Option<u64>, actual: Option<u64>| {
            protocol::trigger_resend(&shared.protocol, shared.config.repetier_resends, expected, actual)
        };
        let current_last_n = || shared.protocol.lock().unwrap().last_n;
        let lines = debug::process(&shared.debug, &shared.drop_connection, current_last_n, trigger, rest);
        push_all(shared, lines);
        return;
    }

    if shared.config.ok_before {
        push_all(shared, vec![ok_line(shared)]);
    }

    let result = dispatch::dispatch(shared, &command_text);
    push_all(shared, result.lines);

    if let Some(cmd) = gcode::parse_command(&command_text) {
        if let Some(secs) = debug::take_post_command_sleep(&shared.debug, &cmd.token()) {
            std::thread::sleep(Duration::from_secs_f64(secs));
            push_all(shared, vec![format!("// sleeping for {} seconds", secs as u64)]);
        }
    }

    if !shared.config.ok_before && !result.suppress_generic_ok {
        push_all(shared, vec![ok_line(shared)]);
    }
}

fn append_sd_write_line(shared: &Arc<Shared>, name: &str, line: &str) {
    let mut data = line.as_bytes().to_vec();
    data.push(b'\n');
    if let Err(e) = shared.fs.append(name, &data) {
        log::warn!("failed to append to SD file {}: {}", name, e);
    }
}

fn sleep_in_slices(shared: &Arc<Shared>, seconds: f64) {
    const SLICE: f64 = 0.05;
    let mut remaining = seconds.max(0.0);
    while remaining > 0.0 {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(Duration::from_secs_f64(step));
        remaining -= step;
    }
}

fn move_worker(shared: Arc<Shared>) {
    while !shared.stopped.load(Ordering::SeqCst) {
        match shared.move_queue.get(Duration::from_millis(500)) {
            Ok(raw_line) => {
                shared.move_in_flight.store(true, Ordering::SeqCst);
                let axes = dispatch::axes_from(&raw_line);
                let duration = shared.motion.lock().unwrap().apply_move(axes);
                sleep_in_slices(&shared, duration);
                shared.move_in_flight.store(false, Ordering::SeqCst);
            }
            Err(QueueError::Closed) => break,
            Err(_) => continue,
        }
    }
}

/// Invoked synchronously from `M109`/`M190` dispatch: blocks the reader
/// thread (and therefore the matching `ok`) until the named heater reaches
/// its target, emitting a temperature line once per second while it waits.
pub(crate) fn wait_for_heatup(shared: &Arc<Shared>, heater: Heater) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        {
            let thermal = shared.thermal.lock().unwrap();
            let at_target = match heater {
                Heater::Extruder(tool) => thermal.extruder_at_target(tool),
                Heater::Bed => thermal.bed_at_target(),
            };
            if at_target {
                return;
            }
        }
        std::thread::sleep(Duration::from_secs(1));
        let report = {
            let mut thermal = shared.thermal.lock().unwrap();
            thermal.tick();
            thermal.report()
        };
        shared.tx.put(report, true, None).ok();
    }
}

/// `M24`: spawns the SD printer task if none is running yet, or simply
/// re-opens the pause gate if one already is.
pub(crate) fn start_or_resume_sd_print(shared: &Arc<Shared>) {
    let mut sd_state = shared.sd.lock().unwrap();
    if sd_state.printer_running {
        drop(sd_state);
        shared.sd_gate.set();
        return;
    }
    let Some(name) = sd_state.selected_file.clone() else {
        return;
    };
    sd_state.printer_running = true;
    drop(sd_state);
    shared.sd_gate.set();

    let task_shared = Arc::clone(shared);
    std::thread::spawn(move || sd_print_task(task_shared, name));
}

fn sd_print_task(shared: Arc<Shared>, name: String) {
    let reader = match shared.fs.open_read(&name) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("failed to open SD file {} for printing: {}", name, e);
            shared.sd.lock().unwrap().printer_running = false;
            return;
        }
    };
    let mut reader = BufReader::new(reader);

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let seek_to = shared.sd.lock().unwrap().new_file_pos.take();
        if let Some(pos) = seek_to {
            if let Err(e) = reader.seek(SeekFrom::Start(pos)) {
                log::warn!("failed to seek SD file {}: {}", name, e);
            }
            shared.sd.lock().unwrap().selected_file_pos = pos;
        } else {
            let pos = reader.stream_position().unwrap_or(0);
            shared.sd.lock().unwrap().selected_file_pos = pos;
        }

        if !shared.sd_gate.wait_timeout(Duration::from_millis(250)) {
            continue;
        }

        let mut line = String::new();
        let bytes_read = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("failed reading SD file {}: {}", name, e);
                break;
            }
        };
        if bytes_read == 0 {
            push_all(&shared, vec!["Done printing file".to_string()]);
            break;
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() {
            apply_sd_line(&shared, trimmed);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    shared.sd_gate.clear();
    let mut sd_state = shared.sd.lock().unwrap();
    sd_state.printer_running = false;
    sd_state.selected_file_pos = 0;
}

/// `M104`/`M109` set a hotend target without blocking; `M140`/`M190` do the
/// same for the bed. Every other line executes through normal dispatch
/// (moves still enqueue into the move queue as they would from a live
/// connection).
fn apply_sd_line(shared: &Arc<Shared>, line: &str) {
    let Some(cmd) = gcode::parse_command(line) else {
        return;
    };
    match cmd.token().as_str() {
        "M104" | "M109" => {
            if let Some(temp) = gcode::extract_f64(line, 'S') {
                let tool = gcode::extract_u64(line, 'T').unwrap_or(0) as usize;
                let mut thermal = shared.thermal.lock().unwrap();
                if tool < thermal.extruder_target.len() {
                    thermal.extruder_target[tool] = temp as f32;
                }
            }
        }
        "M140" | "M190" => {
            if let Some(temp) = gcode::extract_f64(line, 'S') {
                shared.thermal.lock().unwrap().bed_target = temp as f32;
            }
        }
        _ => {
            dispatch::dispatch(shared, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::DiskFilesystem;
    use std::time::Duration as StdDuration;

    fn test_device() -> (Device, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            virtual_sd: dir.path().to_path_buf(),
            read_timeout: 0.2,
            ..Config::default()
        };
        let fs = Box::new(DiskFilesystem::new(dir.path()));
        let device = Device::new(config, fs, || "VirtualMarlin 1.0".to_string());
        (device, dir)
    }

    fn drain_until(device: &Device, predicate: impl Fn(&str) -> bool, attempts: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..attempts {
            let line = device.read().unwrap();
            if line.is_empty() {
                continue;
            }
            let matched = predicate(&line);
            lines.push(line);
            if matched {
                break;
            }
        }
        lines
    }

    #[test]
    fn boot_banner_is_emitted_in_order() {
        let (device, _dir) = test_device();
        assert_eq!(device.read().unwrap(), "start\n");
        assert_eq!(device.read().unwrap(), "Marlin: Virtual Marlin!\n");
        assert_eq!(device.read().unwrap(), "\u{80}\n");
        assert_eq!(device.read().unwrap(), "SD card ok\n");
    }

    #[test]
    fn line_number_handshake_recovers_via_resend() {
        let (device, _dir) = test_device();
        for _ in 0..4 {
            device.read().unwrap();
        }

        device.write("N1 M110*0\n").unwrap();
        assert_eq!(device.read().unwrap(), "ok\n");

        device.write("N3 G0 X10*0\n").unwrap();
        assert_eq!(device.read().unwrap(), "Error: expected line 2 got 3\n");
        assert_eq!(device.read().unwrap(), "Resend:2\n");
        assert_eq!(device.read().unwrap(), "ok\n");

        device.write("N2 G0 X10*0\n").unwrap();
        let lines = drain_until(&device, |l| l == "ok\n", 5);
        assert_eq!(lines.last().unwrap(), "ok\n");
    }

    #[test]
    fn m112_stops_further_output() {
        let (device, _dir) = test_device();
        for _ in 0..4 {
            device.read().unwrap();
        }
        device.write("M112\n").unwrap();
        let lines = drain_until(
            &device,
            |l| l.contains("EMERGENCY SHUTDOWN DETECTED. KILLED."),
            5,
        );
        assert!(lines
            .iter()
            .any(|l| l.contains("EMERGENCY SHUTDOWN DETECTED. KILLED.")));

        device.write("G28\n").unwrap();
        std::thread::sleep(StdDuration::from_millis(50));
        assert_eq!(device.read().unwrap(), "");
    }

    #[test]
    fn sd_write_cycle_round_trips_exact_bytes() {
        let (device, dir) = test_device();
        for _ in 0..4 {
            device.read().unwrap();
        }

        device.write("M28 test.g\n").unwrap();
        drain_until(&device, |l| l.starts_with("Writing to file"), 3);
        device.write("G1 X1\n").unwrap();
        drain_until(&device, |l| l == "ok\n", 3);
        device.write("G1 X2\n").unwrap();
        drain_until(&device, |l| l == "ok\n", 3);
        device.write("M29\n").unwrap();
        drain_until(&device, |l| l == "ok\n", 3);

        let contents = std::fs::read_to_string(dir.path().join("test.g")).unwrap();
        assert_eq!(contents, "G1 X1\nG1 X2\n");
    }
}
