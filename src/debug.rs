//! The debug injector.
//!
//! Parses `!!DEBUG:<payload>` meta-commands that let tests deterministically
//! perturb the firmware: scheduling post-command sleeps, forcing resends,
//! dropping the connection, or emitting action triggers a host would
//! otherwise only see from real print-pause hardware buttons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Default)]
pub struct DebugState {
    pub sleep_after: HashMap<String, f64>,
    pub sleep_after_next: HashMap<String, f64>,
    pub dont_answer: bool,
}

static SLEEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sleep (\d+)$").unwrap());
static SLEEP_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sleep_after ([GMTF]\d+) (\d+)$").unwrap());
static SLEEP_AFTER_NEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sleep_after_next ([GMTF]\d+) (\d+)$").unwrap());
static CUSTOM_ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^action_custom ([a-zA-Z0-9_]+)(\s+.*)?$").unwrap());

const HELP_TEXT: &str = "
Virtual Marlin debug commands

help
?
| This help.

# Action Triggers

action_pause
| Sends a \"// action:pause\" action trigger to the host.
action_resume
| Sends a \"// action:resume\" action trigger to the host.
action_disconnect
| Sends a \"// action:disconnect\" action trigger to the
| host.
action_custom <action>[ <parameters>]
| Sends a custom \"// action:<action> <parameters>\"
| action trigger to the host.

# Communication Errors

dont_answer
| Will not acknowledge the next command.
trigger_resend_lineno
| Triggers a resend error with a line number mismatch
trigger_resend_checksum
| Triggers a resend error with a checksum mismatch
drop_connection
| Drops the serial connection

# Reply Timing / Sleeping

sleep <int:seconds>
| Sleep <seconds> s
sleep_after <str:command> <int:seconds>
| Sleeps <seconds> s after each execution of <command>
sleep_after_next <str:command> <int:seconds>
| Sleeps <seconds> s after execution of <command>
";

/// Processes one `!!DEBUG:` payload, returning the response lines it
/// produces. `trigger_resend` is invoked for the two resend-injection verbs
/// so this module doesn't need to know about line-number bookkeeping
/// directly (that's component C3's job); `current_last_n` supplies the
/// current `last_n` for `trigger_resend_lineno`, which reuses the current
/// value directly rather than recomputing an "expected" one.
pub fn process(
    state: &Mutex<DebugState>,
    drop_connection: &AtomicBool,
    current_last_n: impl Fn() -> u64,
    trigger_resend: impl Fn(Option<u64>, Option<u64>) -> Vec<String>,
    payload: &str,
) -> Vec<String> {
    let payload = payload.trim();

    if payload.is_empty() || payload == "help" || payload == "?" {
        return HELP_TEXT
            .lines()
            .map(|l| format!("echo: {}", l.trim()))
            .collect();
    }

    match payload {
        "action_pause" => return vec!["// action:pause".to_string()],
        "action_resume" => return vec!["// action:resume".to_string()],
        "action_disconnect" => return vec!["// action:disconnect".to_string()],
        "dont_answer" => {
            state.lock().unwrap().dont_answer = true;
            return vec![];
        }
        "trigger_resend_lineno" => {
            let last_n = current_last_n();
            return trigger_resend(Some(last_n), Some(last_n + 1));
        }
        "trigger_resend_checksum" => {
            let last_n = current_last_n();
            return trigger_resend(Some(last_n), None);
        }
        "drop_connection" => {
            drop_connection.store(true, Ordering::SeqCst);
            return vec![];
        }
        _ => {}
    }

    if let Some(caps) = SLEEP_RE.captures(payload) {
        let secs: u64 = caps[1].parse().unwrap_or(0);
        let line = format!("// sleeping for {} seconds", secs);
        std::thread::sleep(Duration::from_secs(secs));
        return vec![line];
    }

    if let Some(caps) = SLEEP_AFTER_RE.captures(payload) {
        let command = caps[1].to_string();
        let secs: f64 = caps[2].parse().unwrap_or(0.0);
        let msg = format!(
            "// going to sleep {} seconds after each {}",
            secs as u64, command
        );
        state.lock().unwrap().sleep_after.insert(command, secs);
        return vec![msg];
    }

    if let Some(caps) = SLEEP_AFTER_NEXT_RE.captures(payload) {
        let command = caps[1].to_string();
        let secs: f64 = caps[2].parse().unwrap_or(0.0);
        let msg = format!(
            "// going to sleep {} seconds after next {}",
            secs as u64, command
        );
        state
            .lock()
            .unwrap()
            .sleep_after_next
            .insert(command, secs);
        return vec![msg];
    }

    if let Some(caps) = CUSTOM_ACTION_RE.captures(payload) {
        let action = &caps[1];
        let params = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let line = format!("// action:{} {}", action, params);
        return vec![line.trim_end().to_string()];
    }

    // Malformed debug commands are swallowed silently.
    vec![]
}

/// Consumes the one-shot suppression flag, returning whether the *current*
/// incoming line should be discarded without a reply.
pub fn take_dont_answer(state: &Mutex<DebugState>) -> bool {
    let mut guard = state.lock().unwrap();
    std::mem::replace(&mut guard.dont_answer, false)
}

/// Consumes any post-command sleep registered for `command`, preferring the
/// one-shot `sleep_after_next` entry over the sticky `sleep_after` one.
pub fn take_post_command_sleep(state: &Mutex<DebugState>, command: &str) -> Option<f64> {
    let mut guard = state.lock().unwrap();
    if let Some(secs) = guard.sleep_after_next.remove(command) {
        return Some(secs);
    }
    guard.sleep_after.get(command).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_resend(_expected: Option<u64>, _actual: Option<u64>) -> Vec<String> {
        vec!["Resend:stub".to_string()]
    }

    #[test]
    fn help_lines_are_echo_prefixed() {
        let state = Mutex::new(DebugState::default());
        let drop = AtomicBool::new(false);
        let lines = process(&state, &drop, || 0, noop_resend, "");
        assert!(lines.iter().all(|l| l.starts_with("echo: ")));
        assert!(lines.iter().any(|l| l.contains("action_pause")));
    }

    #[test]
    fn custom_action_trims_params() {
        let state = Mutex::new(DebugState::default());
        let drop = AtomicBool::new(false);
        let lines = process(&state, &drop, || 0, noop_resend, "action_custom foo  bar ");
        assert_eq!(lines, vec!["// action:foo bar".to_string()]);
    }

    #[test]
    fn sleep_after_registers_and_sleep_after_next_wins() {
        let state = Mutex::new(DebugState::default());
        let drop = AtomicBool::new(false);
        process(&state, &drop, || 0, noop_resend, "sleep_after G1 5");
        process(&state, &drop, || 0, noop_resend, "sleep_after_next G1 2");
        assert_eq!(take_post_command_sleep(&state, "G1"), Some(2.0));
        assert_eq!(take_post_command_sleep(&state, "G1"), Some(5.0));
    }

    #[test]
    fn drop_connection_is_sticky() {
        let state = Mutex::new(DebugState::default());
        let drop = AtomicBool::new(false);
        process(&state, &drop, || 0, noop_resend, "drop_connection");
        assert!(drop.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_command_is_swallowed() {
        let state = Mutex::new(DebugState::default());
        let drop = AtomicBool::new(false);
        let lines = process(&state, &drop, || 0, noop_resend, "not_a_real_command");
        assert!(lines.is_empty());
    }
}
