//! Minimal G-code line tokenizing.
//!
//! The dialect this device speaks only ever needs two things: the leading
//! `[GMTF]<code>` token, and a handful of named numeric parameters pulled
//! out of the rest of the line by position-independent regex
//! (`Regex::new("X(...)")` and friends against the whole line). There is no
//! general-purpose AST here: a full parser with ordered, duplicate-checked
//! parameters is overkill when nothing in this protocol emulator ever needs
//! more than "does axis X appear, and what's its value".

use once_cell::sync::Lazy;
use regex::Regex;

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([GMTF])(\d+)").unwrap());
static LINE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^N(\d+)").unwrap());

/// The leading token of a line, e.g. `("G", 1)` for `G1 X10 F3000`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub letter: char,
    pub number: u32,
}

impl Command {
    /// Canonical form, e.g. `G1`, used as a dispatch-table key.
    pub fn token(&self) -> String {
        format!("{}{}", self.letter, self.number)
    }
}

/// Matches the leading `[GMTF]<digits>` token of a line, if present.
pub fn parse_command(line: &str) -> Option<Command> {
    let caps = COMMAND_RE.captures(line)?;
    let letter = caps.get(1)?.as_str().chars().next()?;
    let number: u32 = caps.get(2)?.as_str().parse().ok()?;
    Some(Command { letter, number })
}

/// Extracts the line number from a leading `N` prefix (e.g. `N12 G1 X1*37`
/// -> `Some(12)`). Anchored to the start of the line: an `N` appearing later
/// (e.g. inside `M28 test_N5.g`) is not a line number.
pub fn parse_line_number(line: &str) -> Option<u64> {
    LINE_NUMBER_RE
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Extracts a floating point parameter following `letter` (e.g. `X10.5`):
/// first match anywhere in the line, garbage elsewhere is ignored.
pub fn extract_f64(line: &str, letter: char) -> Option<f64> {
    let re = axis_regex(letter);
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Extracts an unsigned integer parameter, used for `T<tool>` and `S<pos>`
/// style fields that are never fractional.
pub fn extract_u64(line: &str, letter: char) -> Option<u64> {
    extract_f64(line, letter).map(|v| v as u64)
}

fn axis_regex(letter: char) -> Regex {
    // Compiling per-call is fine here: dispatch only ever looks at a
    // handful of letters per line and lines arrive at serial-port speed,
    // not in a hot loop.
    Regex::new(&format!(r"{}(-?[0-9]*\.?[0-9]+)", regex::escape(&letter.to_string()))).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_command() {
        let cmd = parse_command("G1 X10 Y-5.2 F3000").unwrap();
        assert_eq!(cmd.letter, 'G');
        assert_eq!(cmd.number, 1);
        assert_eq!(cmd.token(), "G1");
    }

    #[test]
    fn no_command_present() {
        assert!(parse_command("hello").is_none());
    }

    #[test]
    fn extracts_params() {
        assert_eq!(extract_f64("G1 X10 Y-5.2 F3000", 'X'), Some(10.0));
        assert_eq!(extract_f64("G1 X10 Y-5.2 F3000", 'Y'), Some(-5.2));
        assert_eq!(extract_f64("G1 X10 Y-5.2 F3000", 'Z'), None);
    }

    #[test]
    fn extracts_line_number() {
        assert_eq!(parse_line_number("N12 G1 X1*37"), Some(12));
        assert_eq!(parse_line_number("G1 X1"), None);
    }

    #[test]
    fn ignores_n_that_is_not_a_leading_line_number() {
        assert_eq!(parse_line_number("M28 test_N5.g"), None);
    }
}
