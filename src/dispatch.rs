//! The command dispatcher.
//!
//! Two explicit lookup tables replace attribute-name-synthesis dispatch: a
//! per-letter table consulted first (`T`, `F`), then a per-opcode table
//! keyed by the full token (`M104`, `G1`, ...).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::device::Shared;
use crate::gcode::{self, Command};
use crate::motion::Axes;
use crate::sd;

/// Result of dispatching one command line.
pub struct DispatchResult {
    pub lines: Vec<String>,
    /// When true, the reader loop must not append its own generic `ok` (or
    /// `ok <N>`) after this command — the handler already emitted one
    /// itself, formatted into its own response line (`M105`, `M114`).
    pub suppress_generic_ok: bool,
}

impl DispatchResult {
    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            suppress_generic_ok: false,
        }
    }

    fn none() -> Self {
        Self {
            lines: vec![],
            suppress_generic_ok: false,
        }
    }
}

type LetterHandler = fn(&Arc<Shared>, &Command, &str) -> (bool, DispatchResult);
type OpcodeHandler = fn(&Arc<Shared>, &Command, &str) -> DispatchResult;

static LETTER_HANDLERS: Lazy<HashMap<char, LetterHandler>> = Lazy::new(|| {
    let mut m: HashMap<char, LetterHandler> = HashMap::new();
    m.insert('T', handle_t);
    m.insert('F', handle_f);
    m
});

static OPCODE_HANDLERS: Lazy<HashMap<&'static str, OpcodeHandler>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, OpcodeHandler> = HashMap::new();
    m.insert("M104", handle_m104);
    m.insert("M109", handle_m109);
    m.insert("M140", handle_m140);
    m.insert("M190", handle_m190);
    m.insert("M105", handle_m105);
    m.insert("M20", handle_m20);
    m.insert("M21", handle_m21);
    m.insert("M22", handle_m22);
    m.insert("M23", handle_m23);
    m.insert("M24", handle_m24);
    m.insert("M25", handle_m25);
    m.insert("M26", handle_m26);
    m.insert("M27", handle_m27);
    m.insert("M28", handle_m28);
    m.insert("M29", handle_m29);
    m.insert("M30", handle_m30);
    m.insert("M114", handle_m114);
    m.insert("M117", handle_m117);
    m.insert("M400", handle_m400);
    m.insert("M999", handle_m999);
    m.insert("G20", handle_g20);
    m.insert("G21", handle_g21);
    m.insert("G90", handle_g90);
    m.insert("G91", handle_g91);
    m.insert("G92", handle_g92);
    m.insert("G28", handle_g28);
    m.insert("G0", handle_move);
    m.insert("G1", handle_move);
    m.insert("G2", handle_move);
    m.insert("G3", handle_move);
    m
});

/// Dispatches `payload` (the command text, checksum/line-number already
/// stripped, no trailing newline). Unknown commands fall through silently.
pub fn dispatch(shared: &Arc<Shared>, payload: &str) -> DispatchResult {
    let Some(command) = gcode::parse_command(payload) else {
        return DispatchResult::none();
    };

    if let Some(letter_handler) = LETTER_HANDLERS.get(&command.letter) {
        let (handled, result) = letter_handler(shared, &command, payload);
        if handled {
            return result;
        }
        // Not handled at the letter level: fall through to the opcode
        // table (there usually isn't one for bare F/T tokens), carrying
        // forward any lines the letter handler already produced.
        if let Some(opcode_handler) = OPCODE_HANDLERS.get(command.token().as_str()) {
            let mut opcode_result = opcode_handler(shared, &command, payload);
            let mut lines = result.lines;
            lines.append(&mut opcode_result.lines);
            opcode_result.lines = lines;
            return opcode_result;
        }
        return result;
    }

    if let Some(opcode_handler) = OPCODE_HANDLERS.get(command.token().as_str()) {
        return opcode_handler(shared, &command, payload);
    }

    DispatchResult::none()
}

pub(crate) fn axes_from(raw: &str) -> Axes {
    Axes {
        x: gcode::extract_f64(raw, 'X'),
        y: gcode::extract_f64(raw, 'Y'),
        z: gcode::extract_f64(raw, 'Z'),
        e: gcode::extract_f64(raw, 'E'),
    }
}

fn handle_t(shared: &Arc<Shared>, command: &Command, _raw: &str) -> (bool, DispatchResult) {
    shared
        .active_extruder
        .store(command.number as usize, std::sync::atomic::Ordering::SeqCst);
    (
        true,
        DispatchResult::lines(vec![format!("Active Extruder: {}", command.number)]),
    )
}

fn handle_f(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> (bool, DispatchResult) {
    if shared.config.support_f {
        (false, DispatchResult::lines(vec!["echo:changed F value".to_string()]))
    } else {
        (
            true,
            DispatchResult::lines(vec!["Error: Unknown command F".to_string()]),
        )
    }
}

fn tool_from(raw: &str) -> usize {
    gcode::extract_u64(raw, 'T').unwrap_or(0) as usize
}

fn handle_m104(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    let tool = tool_from(raw);
    if let Some(temp) = gcode::extract_f64(raw, 'S') {
        let mut thermal = shared.thermal.lock().unwrap();
        if tool < thermal.extruder_target.len() {
            thermal.extruder_target[tool] = temp as f32;
        }
    }
    DispatchResult::none()
}

fn handle_m109(shared: &Arc<Shared>, command: &Command, raw: &str) -> DispatchResult {
    let result = handle_m104(shared, command, raw);
    let tool = tool_from(raw);
    crate::device::wait_for_heatup(shared, Heater::Extruder(tool));
    result
}

fn handle_m140(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    if let Some(temp) = gcode::extract_f64(raw, 'S') {
        shared.thermal.lock().unwrap().bed_target = temp as f32;
    }
    DispatchResult::none()
}

fn handle_m190(shared: &Arc<Shared>, command: &Command, raw: &str) -> DispatchResult {
    let result = handle_m140(shared, command, raw);
    crate::device::wait_for_heatup(shared, Heater::Bed);
    result
}

pub enum Heater {
    Extruder(usize),
    Bed,
}

fn handle_m105(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    let report = shared.thermal.lock().unwrap().report();
    let line = if shared.config.ok_before {
        report
    } else {
        format!("ok {}", report)
    };
    DispatchResult {
        lines: vec![line],
        suppress_generic_ok: true,
    }
}

fn handle_m20(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    let sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    drop(sd_state);
    DispatchResult::lines(sd::list(shared.fs.as_ref()))
}

fn handle_m21(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.sd.lock().unwrap().ready = true;
    DispatchResult::lines(vec!["SD card ok".to_string()])
}

fn handle_m22(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.sd.lock().unwrap().ready = false;
    DispatchResult::none()
}

fn filename_arg(raw: &str) -> String {
    raw.splitn(2, char::is_whitespace)
        .nth(1)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn handle_m23(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    let mut sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    let name = filename_arg(raw);
    DispatchResult::lines(sd::select(&mut sd_state, shared.fs.as_ref(), &name))
}

fn handle_m24(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    if !shared.sd.lock().unwrap().ready {
        return DispatchResult::none();
    }
    crate::device::start_or_resume_sd_print(shared);
    DispatchResult::none()
}

fn handle_m25(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    if !shared.sd.lock().unwrap().ready {
        return DispatchResult::none();
    }
    shared.sd_gate.clear();
    DispatchResult::none()
}

fn handle_m26(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    let mut sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    if let Some(pos) = gcode::extract_u64(raw, 'S') {
        sd_state.new_file_pos = Some(pos);
    }
    DispatchResult::none()
}

fn handle_m27(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    let sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    DispatchResult::lines(vec![sd::report_status(&sd_state)])
}

fn handle_m28(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    let mut sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    let name = filename_arg(raw);
    DispatchResult::lines(sd::write_begin(&mut sd_state, shared.fs.as_ref(), &name))
}

fn handle_m29(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    let mut sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    sd::write_end(&mut sd_state);
    DispatchResult::none()
}

fn handle_m30(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    let sd_state = shared.sd.lock().unwrap();
    if !sd_state.ready {
        return DispatchResult::none();
    }
    drop(sd_state);
    let name = filename_arg(raw);
    sd::delete(shared.fs.as_ref(), &name);
    DispatchResult::none()
}

fn handle_m114(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    let report = shared.motion.lock().unwrap().report();
    let line = if shared.config.ok_before {
        report
    } else {
        format!("ok {}", report)
    };
    DispatchResult {
        lines: vec![line],
        suppress_generic_ok: true,
    }
}

fn handle_m117(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    if !shared.config.echo_m117 {
        return DispatchResult::none();
    }
    let msg = raw
        .splitn(2, char::is_whitespace)
        .nth(1)
        .unwrap_or("")
        .trim();
    DispatchResult::lines(vec![format!("echo:{}", msg)])
}

fn handle_m400(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    while !shared.stopped.load(std::sync::atomic::Ordering::SeqCst) {
        if shared.move_queue.occupied() == 0 && !shared.move_in_flight.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    DispatchResult::none()
}

fn handle_m999(_shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    DispatchResult::lines(vec!["Resend: 1".to_string()])
}

fn handle_g20(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.motion.lock().unwrap().set_unit_modifier(1.0 / 2.54);
    DispatchResult::none()
}

fn handle_g21(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.motion.lock().unwrap().set_unit_modifier(1.0);
    DispatchResult::none()
}

fn handle_g90(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.motion.lock().unwrap().relative = false;
    DispatchResult::none()
}

fn handle_g91(shared: &Arc<Shared>, _command: &Command, _raw: &str) -> DispatchResult {
    shared.motion.lock().unwrap().relative = true;
    DispatchResult::none()
}

fn handle_g92(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    shared.motion.lock().unwrap().set_position(axes_from(raw));
    DispatchResult::none()
}

fn handle_g28(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    // Homing executes immediately rather than through the move queue:
    // apply it synchronously on the reader thread.
    shared.motion.lock().unwrap().apply_move(axes_from(raw));
    DispatchResult::none()
}

fn handle_move(shared: &Arc<Shared>, _command: &Command, raw: &str) -> DispatchResult {
    // Back-pressures the dispatcher: this blocks (without a timeout) until
    // the move queue has room.
    let _ = shared.move_queue.put(raw.to_string(), true, None);
    DispatchResult::none()
}
