//! Size-rotated audit log files.
//!
//! The active file is `<dir>/<stem>.log`. Once a write leaves it larger than
//! `max_file_size`, it is renamed to `<stem>-YYYYmmdd-HHMMSS.log` (with a
//! `-<n>` suffix if that name is taken) and a fresh, empty active file is
//! opened. Only the newest `max_rotated_files` rotated files are kept.
//!
//! Writes and rotation happen under one mutex, so a line is always written
//! whole into exactly one file.

use crate::application::ports::{Clock, LogFileInfo, LogSink};
use crate::error::ConfigError;
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const EXTENSION: &str = "log";
const SUFFIX_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Rotation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSinkConfig {
    /// File name without extension (default: "access-guard")
    pub stem: String,
    /// Rotation threshold in bytes (default: 5 MiB)
    pub max_file_size: u64,
    /// Rotated files to keep (default: 5)
    pub max_rotated_files: usize,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            stem: "access-guard".to_string(),
            max_file_size: 5 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

impl FileSinkConfig {
    /// Check the settings.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidAudit`] for an empty or path-like stem
    /// or a zero size threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stem.is_empty() || self.stem.contains(['/', '\\', '.']) {
            return Err(ConfigError::InvalidAudit(format!(
                "invalid log file stem {:?}",
                self.stem
            )));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidAudit(
                "max_file_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ActiveFile {
    file: File,
    size: u64,
}

/// [`LogSink`] writing JSON lines to size-rotated files.
#[derive(Debug)]
pub struct RotatingFileSink {
    dir: PathBuf,
    config: FileSinkConfig,
    clock: Arc<dyn Clock>,
    active: Mutex<ActiveFile>,
}

impl RotatingFileSink {
    /// Open (or create) the active log file in `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: FileSinkConfig) -> io::Result<Self> {
        Self::open_with_clock(dir, config, Arc::new(SystemClock::new()))
    }

    /// Like [`open`](Self::open), naming rotated files after `clock`.
    pub fn open_with_clock(
        dir: impl Into<PathBuf>,
        config: FileSinkConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", config.stem, EXTENSION));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            dir,
            config,
            clock,
            active: Mutex::new(ActiveFile { file, size }),
        })
    }

    /// Directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.config.stem, EXTENSION))
    }

    fn rotate(&self, active: &mut ActiveFile) -> io::Result<()> {
        active.file.flush()?;
        let stamp = DateTime::<Utc>::from(self.clock.now())
            .format(SUFFIX_FORMAT)
            .to_string();

        let mut target = self
            .dir
            .join(format!("{}-{}.{}", self.config.stem, stamp, EXTENSION));
        let mut n = 1;
        while target.exists() {
            target = self
                .dir
                .join(format!("{}-{}-{}.{}", self.config.stem, stamp, n, EXTENSION));
            n += 1;
        }

        fs::rename(self.active_path(), &target)?;
        active.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.active_path())?;
        active.size = 0;
        tracing::debug!(rotated = %target.display(), "audit log rotated");

        self.prune()
    }

    fn prune(&self) -> io::Result<()> {
        let rotated = self.rotated_files()?;
        for (path, _) in rotated.into_iter().skip(self.config.max_rotated_files) {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Rotated files with their sort key, newest first.
    fn rotated_files(&self) -> io::Result<Vec<(PathBuf, (String, u32))>> {
        let mut rotated = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = parse_rotated_name(&self.config.stem, name) {
                rotated.push((entry.path(), key));
            }
        }
        rotated.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(rotated)
    }

    fn describe(&self, path: &Path) -> io::Result<LogFileInfo> {
        let metadata = fs::metadata(path)?;
        Ok(LogFileInfo {
            path: path
                .strip_prefix(&self.dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.to_path_buf()),
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

impl LogSink for RotatingFileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit log lock poisoned"))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        active.file.write_all(&buf)?;
        active.size += buf.len() as u64;

        if active.size > self.config.max_file_size {
            // The line is already on disk; a failed rotation only delays the next one
            if let Err(err) = self.rotate(&mut active) {
                tracing::warn!(error = %err, "audit log rotation failed");
            }
        }
        Ok(())
    }

    fn list_files(&self) -> io::Result<Vec<LogFileInfo>> {
        let _guard = self
            .active
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit log lock poisoned"))?;

        let mut files = vec![self.describe(&self.active_path())?];
        for (path, _) in self.rotated_files()? {
            files.push(self.describe(&path)?);
        }
        Ok(files)
    }
}

/// Sort key of a rotated file name: `(timestamp, collision index)`.
fn parse_rotated_name(stem: &str, name: &str) -> Option<(String, u32)> {
    let rest = name
        .strip_prefix(stem)?
        .strip_prefix('-')?
        .strip_suffix(".log")?;
    let mut parts = rest.split('-');
    let date = parts.next()?;
    let time = parts.next()?;
    let n = match parts.next() {
        Some(n) => n.parse().ok()?,
        None => 0,
    };
    let well_formed = date.len() == 8
        && time.len() == 6
        && date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit())
        && parts.next().is_none();
    well_formed.then(|| (format!("{}{}", date, time), n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::time::Duration;

    #[test]
    fn test_parse_rotated_name() {
        assert_eq!(
            parse_rotated_name("audit", "audit-20261019-120000.log"),
            Some(("20261019120000".to_string(), 0))
        );
        assert_eq!(
            parse_rotated_name("audit", "audit-20261019-120000-2.log"),
            Some(("20261019120000".to_string(), 2))
        );
        assert_eq!(parse_rotated_name("audit", "audit.log"), None);
        assert_eq!(parse_rotated_name("audit", "other-20261019-120000.log"), None);
        assert_eq!(parse_rotated_name("audit", "audit-2026-120000.log"), None);
    }

    #[test]
    fn test_rotation_keeps_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let clock = MockClock::at_unix(1_760_875_200);
        let sink = RotatingFileSink::open_with_clock(
            dir.path(),
            FileSinkConfig {
                stem: "audit".to_string(),
                max_file_size: 64,
                max_rotated_files: 5,
            },
            Arc::new(clock.clone()),
        )
        .unwrap();

        for i in 0..10 {
            sink.write_line(&format!("{{\"n\":{}}}", i)).unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let mut lines = Vec::new();
        for info in sink.list_files().unwrap() {
            let text = fs::read_to_string(dir.path().join(&info.path)).unwrap();
            lines.extend(text.lines().map(str::to_string));
        }
        lines.sort();
        let mut expected: Vec<String> = (0..10).map(|i| format!("{{\"n\":{}}}", i)).collect();
        expected.sort();
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_same_second_rotations_get_index_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let clock = MockClock::at_unix(1_760_875_200);
        let sink = RotatingFileSink::open_with_clock(
            dir.path(),
            FileSinkConfig {
                stem: "audit".to_string(),
                max_file_size: 1,
                max_rotated_files: 10,
            },
            Arc::new(clock),
        )
        .unwrap();

        sink.write_line("a").unwrap();
        sink.write_line("b").unwrap();

        let names: Vec<String> = sink
            .list_files()
            .unwrap()
            .into_iter()
            .map(|info| info.path.display().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "audit.log".to_string(),
                "audit-20251019-120000-1.log".to_string(),
                "audit-20251019-120000.log".to_string(),
            ]
        );
    }

    #[test]
    fn test_invalid_stem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileSinkConfig {
            stem: "../escape".to_string(),
            ..FileSinkConfig::default()
        };
        assert!(RotatingFileSink::open(dir.path(), config).is_err());
    }
}
