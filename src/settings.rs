//! Persisted Settings
//!
//! Files kept under the base directory (by default `$HOME/.dissonance/`):
//!
//! ```text
//! <base>/settings/music_paths.json      directories and files to pick music from
//! <base>/settings/recently_played.json  most recent last, at most 10 entries
//! <base>/logs/<datetime>_logfile.txt    one log file per run
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Entries kept in the recently-played list.
pub const MAX_RECENTLY_PLAYED: usize = 10;

const SETTINGS_DIR: &str = "settings";
const LOGS_DIR: &str = "logs";
const MUSIC_PATHS_FILE: &str = "music_paths.json";
const RECENTLY_PLAYED_FILE: &str = "recently_played.json";

/// Settings errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File or directory
        path: PathBuf,
        /// Cause
        #[source]
        source: io::Error,
    },

    /// A settings file is not a JSON list of strings.
    #[error("{path}: {source}")]
    Format {
        /// File
        path: PathBuf,
        /// Cause
        #[source]
        source: serde_json::Error,
    },
}

/// Directory layout under a base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    base_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(default_base_path())
    }
}

/// `$HOME/.dissonance`, or `./.dissonance` without a home directory.
pub fn default_base_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dissonance")
}

impl Settings {
    /// Settings rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `<base>/settings`.
    pub fn settings_dir(&self) -> PathBuf {
        self.base_path.join(SETTINGS_DIR)
    }

    /// `<base>/logs`.
    pub fn logs_dir(&self) -> PathBuf {
        self.base_path.join(LOGS_DIR)
    }

    /// Create the settings and logs directories.
    pub fn ensure_dirs(&self) -> Result<(), SettingsError> {
        for dir in [self.settings_dir(), self.logs_dir()] {
            fs::create_dir_all(&dir).map_err(|source| SettingsError::Io { path: dir, source })?;
        }
        Ok(())
    }

    /// Log file for a run started at `started`.
    pub fn log_file_path(&self, started: chrono::DateTime<chrono::Local>) -> PathBuf {
        self.logs_dir()
            .join(format!("{}_logfile.txt", started.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// Remove every log file.
    pub fn clear_logs(&self) -> Result<(), SettingsError> {
        let dir = self.logs_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(path = %dir.display(), "logs cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SettingsError::Io { path: dir, source }),
        }
    }

    // =========================================================================
    // LISTS
    // =========================================================================

    /// Configured music directories and files.
    pub fn music_paths(&self) -> Result<Vec<String>, SettingsError> {
        self.read_list(MUSIC_PATHS_FILE)
    }

    /// Add a music directory or file, ignoring duplicates.
    pub fn add_music_path(&self, path: &str) -> Result<(), SettingsError> {
        let mut paths = self.music_paths()?;
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
            self.write_list(MUSIC_PATHS_FILE, &paths)?;
        }
        Ok(())
    }

    /// Recently played audio, most recent last.
    pub fn recently_played(&self) -> Result<Vec<String>, SettingsError> {
        self.read_list(RECENTLY_PLAYED_FILE)
    }

    /// Record `source_path` as most recently played. A known entry moves to
    /// the end; the oldest entries fall off past [`MAX_RECENTLY_PLAYED`].
    pub fn add_recently_played(&self, source_path: &str) -> Result<(), SettingsError> {
        let mut played = self.recently_played()?;
        played.retain(|p| p != source_path);
        played.push(source_path.to_string());
        if played.len() > MAX_RECENTLY_PLAYED {
            played.drain(..played.len() - MAX_RECENTLY_PLAYED);
        }
        debug!(%source_path, entries = played.len(), "recently played updated");
        self.write_list(RECENTLY_PLAYED_FILE, &played)
    }

    fn read_list(&self, file: &str) -> Result<Vec<String>, SettingsError> {
        let path = self.settings_dir().join(file);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        serde_json::from_str(&text).map_err(|source| SettingsError::Format { path, source })
    }

    fn write_list(&self, file: &str, list: &[String]) -> Result<(), SettingsError> {
        self.ensure_dirs()?;
        let path = self.settings_dir().join(file);
        let text = serde_json::to_string_pretty(list).map_err(|source| SettingsError::Format {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(|source| SettingsError::Io { path, source })
    }
}
