use std::fs::ReadDir;
use std::path::{Path, PathBuf};

/// Name fragments used by common microcontroller USB-serial adapters.
pub const DEFAULT_NAME_PATTERNS: [&str; 3] = ["tty.usbserial", "ttyUSB", "ttyACM"];

/// Finds device entries that look like attached microcontrollers.
///
/// Holds no state between scans; every call to `discover` reads the device
/// directory afresh.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    dev_dir: PathBuf,
    patterns: Vec<String>,
}

impl DeviceScanner {
    pub fn new(dev_dir: impl Into<PathBuf>, patterns: Vec<String>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            patterns,
        }
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    /// Lazily list candidate endpoints.
    ///
    /// An unreadable directory yields an empty scan, same as nothing plugged in.
    pub fn discover(&self) -> Discovery<'_> {
        let entries = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => Some(entries),
            Err(e) => {
                log::debug!("Cannot read {}: {}", self.dev_dir.display(), e);
                None
            }
        };
        Discovery { scanner: self, entries }
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new("/dev", DEFAULT_NAME_PATTERNS.iter().map(|p| p.to_string()).collect())
    }
}

/// One pass over the device directory.
pub struct Discovery<'a> {
    scanner: &'a DeviceScanner,
    entries: Option<ReadDir>,
}

impl Iterator for Discovery<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            if self.scanner.matches(&name.to_string_lossy()) {
                return Some(entry.path());
            }
        }
        None
    }
}
