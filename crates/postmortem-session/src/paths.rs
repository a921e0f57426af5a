//! Path resolution for session storage

use std::path::PathBuf;

/// Environment variable overriding the storage root
pub const HOME_ENV: &str = "POSTMORTEM_HOME";

/// Resolves standard paths for session storage and configuration
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    /// Resolve the storage root from `POSTMORTEM_HOME`, falling back to `~/.postmortem`
    pub fn new() -> std::io::Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self {
                root: PathBuf::from(root),
            });
        }

        let home = dirs::home_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found")
        })?;

        Ok(Self {
            root: home.join(".postmortem"),
        })
    }

    /// Use an explicit storage root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one subdirectory per session
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Default configuration file
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Known failure patterns supplied by the user, if any
    pub fn patterns_file(&self) -> PathBuf {
        self.root.join("patterns.json")
    }
}
