//! Per-investigation storage namespaces and retention

use crate::io::{read_json, write_json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const METADATA_FILE: &str = "metadata.json";
const EVIDENCE_DB: &str = "evidence.db";
const EVIDENCE_DIR: &str = "evidence";
const TRAIL_FILE: &str = "trail.jsonl";
const MAX_STEM_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session metadata is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Persisted `metadata.json` contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tool_version: String,
}

/// An isolated storage namespace for one investigation run
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub target: String,
    pub root: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// SQLite file holding the evidence and chunk indexes
    pub fn db_path(&self) -> PathBuf {
        self.root.join(EVIDENCE_DB)
    }

    /// Directory for outputs above the inline threshold
    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join(EVIDENCE_DIR)
    }

    /// Hypothesis state transitions, one JSON record per line
    pub fn trail_path(&self) -> PathBuf {
        self.root.join(TRAIL_FILE)
    }

    fn from_metadata(root: PathBuf, meta: SessionMetadata) -> Self {
        Self {
            id: meta.session_id,
            target: meta.target,
            root,
            created_at: meta.created_at,
        }
    }
}

/// Listing entry for an existing session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: Session,
    pub external_files: usize,
    pub disk_bytes: u64,
}

/// Age/count based cleanup rules
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Sessions older than this many days are eligible for removal
    pub max_age_days: i64,
    /// The newest sessions kept regardless of age
    pub keep_recent: usize,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self {
            max_age_days: 7,
            keep_recent: 5,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates, lists and removes sessions under one base directory
#[derive(Debug, Clone)]
pub struct SessionManager {
    base_dir: PathBuf,
}

impl SessionManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh session for `target` (a dump path or any identifier)
    pub fn create(&self, target: &str) -> Result<Session, SessionError> {
        self.create_at(target, Utc::now())
    }

    pub fn create_at(&self, target: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        std::fs::create_dir_all(&self.base_dir)?;

        let base_id = session_id(target, now);
        let mut id = base_id.clone();
        let mut suffix = 2;
        // create_dir is the exclusive claim on an id
        let root = loop {
            let candidate = self.base_dir.join(&id);
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    id = format!("{}_{}", base_id, suffix);
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        std::fs::create_dir(root.join(EVIDENCE_DIR))?;

        let meta = SessionMetadata {
            session_id: id,
            target: target.to_string(),
            created_at: now,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_json(&root.join(METADATA_FILE), &meta)?;
        tracing::info!(session = %meta.session_id, target, "created session");

        Ok(Session::from_metadata(root, meta))
    }

    /// Open an existing session by id
    pub fn open(&self, id: &str) -> Result<Session, SessionError> {
        let root = self.base_dir.join(id);
        let meta_path = root.join(METADATA_FILE);
        if !meta_path.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let meta: SessionMetadata = read_json(&meta_path)?;
        Ok(Session::from_metadata(root, meta))
    }

    /// All sessions, newest first; directories without metadata are ignored
    pub fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("session_") || !entry.path().is_dir() {
                continue;
            }
            let session = match self.open(&name) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(session = %name, error = %e, "skipping unreadable session");
                    continue;
                }
            };
            let evidence_dir = session.evidence_dir();
            let external_files = std::fs::read_dir(&evidence_dir)
                .map(|it| it.filter_map(Result::ok).count())
                .unwrap_or(0);
            let disk_bytes = dir_size(&session.root);
            sessions.push(SessionInfo {
                session,
                external_files,
                disk_bytes,
            });
        }

        sessions.sort_by(|a, b| {
            b.session
                .created_at
                .cmp(&a.session.created_at)
                .then_with(|| b.session.id.cmp(&a.session.id))
        });
        Ok(sessions)
    }

    /// Remove sessions past retention; returns the removed ids
    pub fn cleanup(&self, policy: &RetentionPolicy) -> Result<Vec<String>, SessionError> {
        self.cleanup_at(policy, Utc::now())
    }

    pub fn cleanup_at(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, SessionError> {
        let cutoff = now - Duration::days(policy.max_age_days);
        let mut removed = Vec::new();

        for info in self.list()?.into_iter().skip(policy.keep_recent) {
            if info.session.created_at >= cutoff {
                continue;
            }
            std::fs::remove_dir_all(&info.session.root)?;
            tracing::info!(session = %info.session.id, "removed expired session");
            removed.push(info.session.id);
        }

        Ok(removed)
    }
}

/// `session_<YYYYmmdd_HHMMSS>_<target stem>`
pub fn session_id(target: &str, now: DateTime<Utc>) -> String {
    let stem = Path::new(target)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(MAX_STEM_LEN)
        .collect();
    if clean.is_empty() {
        clean.push_str("target");
    }
    format!("session_{}_{}", now.format("%Y%m%d_%H%M%S"), clean)
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
