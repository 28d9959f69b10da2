//! The virtual SD subsystem.
//!
//! All paths are resolved under a single backing directory, accessed only
//! through the [`Filesystem`] capability so tests can swap in an in-memory
//! fake instead of touching disk.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

/// Narrow filesystem capability backing the virtual SD card. Names passed
/// in are always relative, already stripped of a leading `/`.
pub trait Filesystem: Send + Sync {
    fn list(&self) -> io::Result<Vec<(String, u64)>>;
    fn exists(&self, name: &str) -> bool;
    fn is_file(&self, name: &str) -> bool;
    fn size(&self, name: &str) -> io::Result<u64>;
    fn append(&self, name: &str, data: &[u8]) -> io::Result<()>;
    fn remove(&self, name: &str) -> io::Result<()>;
    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek + Send>>;
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// `std::fs`-backed implementation rooted at a directory on disk.
pub struct DiskFilesystem {
    root: PathBuf,
}

impl DiskFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Filesystem for DiskFilesystem {
    fn list(&self) -> io::Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let size = entry.metadata()?.len();
            out.push((name, size));
        }
        Ok(out)
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).exists()
    }

    fn is_file(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(name))?.len())
    }

    fn append(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(name))?;
        f.write_all(data)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name))
    }

    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek + Send>> {
        Ok(Box::new(fs::File::open(self.resolve(name))?))
    }
}

/// Strips a leading `/` from a client-supplied filename.
pub fn normalize(name: &str) -> String {
    name.strip_prefix('/').unwrap_or(name).to_string()
}

/// A two-state latch: "set" means the SD printer may proceed, "clear"
/// means it blocks.
#[derive(Default)]
pub struct Gate {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    pub fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Blocks until the gate is open, waking periodically so a kill flag
    /// can be observed by the caller between checks.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let guard = self.state.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.condvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

pub struct SdState {
    pub ready: bool,
    pub selected_file: Option<String>,
    pub selected_file_size: u64,
    pub selected_file_pos: u64,
    pub writing_to_sd: bool,
    pub new_file_pos: Option<u64>,
    pub printer_running: bool,
}

impl Default for SdState {
    fn default() -> Self {
        Self {
            ready: true,
            selected_file: None,
            selected_file_size: 0,
            selected_file_pos: 0,
            writing_to_sd: false,
            new_file_pos: None,
            printer_running: false,
        }
    }
}

/// `M20`: list the directory. Names are looked up lowercased but upcased
/// for display.
pub fn list(fs: &dyn Filesystem) -> Vec<String> {
    let mut lines = vec!["Begin file list".to_string()];
    match fs.list() {
        Ok(mut entries) => {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, size) in entries {
                lines.push(format!("{} {}", name.to_uppercase(), size));
            }
        }
        Err(e) => {
            log::warn!("failed to list virtual SD directory: {}", e);
        }
    }
    lines.push("End file list".to_string());
    lines
}

/// `M23`: select a file for SD printing.
pub fn select(state: &mut SdState, fs: &dyn Filesystem, requested: &str) -> Vec<String> {
    let name = normalize(requested).to_lowercase();
    if !fs.exists(&name) || !fs.is_file(&name) {
        return vec![format!("open failed, File: {}.", requested)];
    }

    let size = fs.size(&name).unwrap_or(0);
    state.selected_file = Some(name);
    state.selected_file_size = size;
    vec![
        format!("File opened: {}  Size: {}", requested, size),
        "File selected".to_string(),
    ]
}

/// `M28`: begin writing a new file over SD.
pub fn write_begin(state: &mut SdState, fs: &dyn Filesystem, requested: &str) -> Vec<String> {
    let name = normalize(requested).to_lowercase();
    if fs.exists(&name) {
        if fs.is_file(&name) {
            if let Err(e) = fs.remove(&name) {
                log::warn!("failed to remove existing SD file {}: {}", name, e);
                return vec!["error writing to file".to_string()];
            }
        } else {
            return vec!["error writing to file".to_string()];
        }
    }

    state.writing_to_sd = true;
    state.selected_file = Some(name);
    vec![format!("Writing to file: {}", requested)]
}

/// `M29`: stop writing to SD.
pub fn write_end(state: &mut SdState) {
    state.writing_to_sd = false;
    state.selected_file = None;
}

/// `M30`: delete a file.
pub fn delete(fs: &dyn Filesystem, requested: &str) {
    let name = normalize(requested);
    if fs.exists(&name) && fs.is_file(&name) {
        if let Err(e) = fs.remove(&name) {
            log::warn!("failed to delete SD file {}: {}", name, e);
        }
    }
}

/// `M27`: report SD printing status.
///
/// Reports progress whenever a printer task is running, regardless of
/// whether it is currently paused on the pause gate.
pub fn report_status(state: &SdState) -> String {
    if state.printer_running {
        format!(
            "SD printing byte {}/{}",
            state.selected_file_pos, state.selected_file_size
        )
    } else {
        "Not SD printing".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::tempdir;

    #[test]
    fn list_upcases_names_and_wraps_markers() {
        let dir = tempdir().unwrap();
        stdfs::write(dir.path().join("test.g"), b"G1 X1\n").unwrap();
        let fs = DiskFilesystem::new(dir.path());
        let lines = list(&fs);
        assert_eq!(lines.first().unwrap(), "Begin file list");
        assert_eq!(lines.last().unwrap(), "End file list");
        assert!(lines.iter().any(|l| l.starts_with("TEST.G ")));
    }

    #[test]
    fn select_missing_file_fails() {
        let dir = tempdir().unwrap();
        let fs = DiskFilesystem::new(dir.path());
        let mut state = SdState::default();
        let lines = select(&mut state, &fs, "missing.g");
        assert_eq!(lines, vec!["open failed, File: missing.g.".to_string()]);
        assert!(state.selected_file.is_none());
    }

    #[test]
    fn select_is_idempotent_in_size() {
        let dir = tempdir().unwrap();
        stdfs::write(dir.path().join("test.g"), b"G1 X1\nG1 X2\n").unwrap();
        let fs = DiskFilesystem::new(dir.path());
        let mut state = SdState::default();
        select(&mut state, &fs, "test.g");
        let size_first = state.selected_file_size;
        select(&mut state, &fs, "test.g");
        assert_eq!(state.selected_file_size, size_first);
    }

    #[test]
    fn write_cycle_appends_exact_bytes() {
        let dir = tempdir().unwrap();
        let fs = DiskFilesystem::new(dir.path());
        let mut state = SdState::default();
        write_begin(&mut state, &fs, "test.g");
        fs.append("test.g", b"G1 X1\n").unwrap();
        fs.append("test.g", b"G1 X2\n").unwrap();
        write_end(&mut state);

        let contents = stdfs::read_to_string(dir.path().join("test.g")).unwrap();
        assert_eq!(contents, "G1 X1\nG1 X2\n");
        assert!(!state.writing_to_sd);
        assert!(state.selected_file.is_none());
    }

    #[test]
    fn status_reports_not_printing_when_no_task() {
        let state = SdState::default();
        assert_eq!(report_status(&state), "Not SD printing");
    }
}
