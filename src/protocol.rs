//! The line protocol decoder: checksum stripping, `N<lineno>` sequencing,
//! and resend recovery.

use std::sync::Mutex;

/// Line-number/checksum bookkeeping, guarded by a mutex in
/// [`crate::device`] so the reader loop can serialize access to it.
#[derive(Default)]
pub struct ProtocolState {
    pub current_line: u64,
    pub last_n: u64,
}

/// Strips a trailing `*<checksum>` suffix, if present, returning the
/// remaining payload. Checksum *validity* is never checked — only its
/// presence, trusting the host's checksum unconditionally.
pub fn strip_checksum(line: &str) -> Option<&str> {
    line.rfind('*').map(|i| &line[..i])
}

/// Emits the error/resend/ok sequence for a line-number mismatch or forced
/// resend, under the protocol lock. `expected` defaults to `last_n + 1`
/// when unspecified; otherwise `last_n` is rewound so the next accepted `N`
/// is `expected`.
pub fn trigger_resend(
    protocol: &Mutex<ProtocolState>,
    repetier_resends: bool,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Vec<String> {
    let mut guard = protocol.lock().unwrap();

    let expected = match expected {
        Some(e) => {
            guard.last_n = e.saturating_sub(1);
            e
        }
        None => guard.last_n + 1,
    };
    drop(guard);

    let mut lines = Vec::new();
    match actual {
        Some(a) => lines.push(format!("Error: expected line {} got {}", expected, a)),
        None => lines.push("Error: Wrong checksum".to_string()),
    }

    let pair = [format!("Resend:{}", expected), "ok".to_string()];
    if repetier_resends {
        lines.extend(pair.clone());
    }
    lines.extend(pair);

    lines
}
