use crate::types::{Chunk, ChunkFinding, Evidence, EvidenceLocation, EvidenceRef, PutStatus};
use chrono::{DateTime, Duration, Utc};
use postmortem_session::{atomic_write, Session};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const ID_PREFIX_LEN: usize = 20;
const FINGERPRINT_LEN: usize = 12;

const SELECT_EVIDENCE: &str = "SELECT seq, id, session_id, command, output_hash, size, storage,
        inline_output, file_path, summary, key_findings, embedding, metadata, created_at
     FROM evidence";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("evidence index failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("evidence file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("evidence record is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp in evidence index: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("evidence not found: {0}")]
    NotFound(String),
    #[error("evidence {0} already has a summary")]
    AlreadySummarized(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage knobs supplied by configuration
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Outputs larger than this many bytes are written to the evidence directory
    pub inline_threshold: usize,
    /// Duplicates older than this are not reused; `None` means the whole session
    pub dedup_window: Option<Duration>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            inline_threshold: 32 * 1024,
            dedup_window: None,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-addressed evidence cache for one session
///
/// Every write goes through the connection mutex, so the duplicate check and
/// the insert in `put` can never interleave with another writer.
pub struct EvidenceStore {
    conn: Mutex<Connection>,
    session_id: String,
    evidence_dir: PathBuf,
    options: StoreOptions,
}

impl EvidenceStore {
    pub fn open(session: &Session, options: StoreOptions) -> Result<Self> {
        Self::open_at(&session.db_path(), session.evidence_dir(), &session.id, options)
    }

    pub fn open_at(
        db_path: &Path,
        evidence_dir: impl Into<PathBuf>,
        session_id: &str,
        options: StoreOptions,
    ) -> Result<Self> {
        let evidence_dir = evidence_dir.into();
        std::fs::create_dir_all(&evidence_dir)?;
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_id: session_id.to_string(),
            evidence_dir,
            options,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS evidence (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                command TEXT NOT NULL,
                output_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                storage TEXT NOT NULL,
                inline_output TEXT,
                file_path TEXT,
                summary TEXT,
                key_findings TEXT NOT NULL,
                embedding TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_evidence_dedup ON evidence(command, output_hash);
            CREATE TABLE IF NOT EXISTS chunks (
                evidence_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                finding TEXT,
                PRIMARY KEY (evidence_id, seq)
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store `output` of `command`, reusing an identical earlier record
    pub fn put(&self, command: &str, output: &str) -> Result<EvidenceRef> {
        self.put_with_metadata(command, output, Map::new())
    }

    pub fn put_with_metadata(
        &self,
        command: &str,
        output: &str,
        mut metadata: Map<String, Value>,
    ) -> Result<EvidenceRef> {
        let output_hash = output_hash(output);
        let conn = self.lock();

        if let Some(existing) = self.find_duplicate(&conn, command, &output_hash, Utc::now())? {
            tracing::debug!(id = %existing.id, command, "reusing duplicate evidence");
            return Ok(existing);
        }

        let mut id = evidence_id(&self.session_id, command, &output_hash);
        let taken: bool = conn
            .query_row("SELECT 1 FROM evidence WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some();
        if taken {
            // an older identical record outside the recency window
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM evidence",
                [],
                |row| row.get(0),
            )?;
            id = format!("{}_{}", id, next);
        }

        let now = Utc::now();
        metadata.insert("timestamp".to_string(), Value::String(now.to_rfc3339()));

        let (storage, inline_output, file_path) = if output.len() > self.options.inline_threshold {
            let path = self.evidence_dir.join(format!("{}.txt", id));
            atomic_write(&path, output.as_bytes())?;
            ("external", None, Some(path.to_string_lossy().to_string()))
        } else {
            ("inline", Some(output), None)
        };

        let inserted = conn.execute(
            "INSERT INTO evidence (id, session_id, command, output_hash, size, storage,
                inline_output, file_path, summary, key_findings, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, '[]', NULL, ?9, ?10)",
            params![
                id,
                self.session_id,
                command,
                output_hash,
                output.len() as i64,
                storage,
                inline_output,
                file_path,
                serde_json::to_string(&metadata)?,
                now.to_rfc3339(),
            ],
        );
        if let Err(e) = inserted {
            // no row points at the body file, so it must not outlive the failed insert
            if let Some(path) = &file_path {
                if let Err(cleanup) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path, error = %cleanup, "could not remove orphaned evidence file");
                }
            }
            return Err(e.into());
        }
        tracing::info!(id = %id, command, size = output.len(), storage, "stored evidence");

        Ok(EvidenceRef {
            id,
            status: PutStatus::Created,
        })
    }

    /// Most recent record with the same command and output hash inside the recency window
    pub fn find_recent_duplicate(&self, command: &str, output_hash: &str) -> Result<Option<EvidenceRef>> {
        let conn = self.lock();
        self.find_duplicate(&conn, command, output_hash, Utc::now())
    }

    fn find_duplicate(
        &self,
        conn: &Connection,
        command: &str,
        output_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EvidenceRef>> {
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT id, summary, created_at FROM evidence
                 WHERE session_id = ?1 AND command = ?2 AND output_hash = ?3
                 ORDER BY seq DESC LIMIT 1",
                params![self.session_id, command, output_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, summary, created_at)) = row else {
            return Ok(None);
        };
        if let Some(window) = self.options.dedup_window {
            let created: DateTime<Utc> = created_at.parse()?;
            if now - created > window {
                return Ok(None);
            }
        }

        let status = if summary.is_some() {
            PutStatus::Reused
        } else {
            PutStatus::NeedsAnalysis
        };
        Ok(Some(EvidenceRef { id, status }))
    }

    pub fn get(&self, id: &str) -> Result<Option<Evidence>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_EVIDENCE))?;
        let mut rows = stmt.query(params![id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_evidence(row)?))
        } else {
            Ok(None)
        }
    }

    /// Like `get`, but a missing record is an error
    pub fn require(&self, id: &str) -> Result<Evidence> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All evidence, most recent first
    pub fn list(&self) -> Result<Vec<Evidence>> {
        self.query_evidence(&format!("{} ORDER BY seq DESC", SELECT_EVIDENCE))
    }

    /// Records stored before analysis finished, oldest first
    pub fn pending_analysis(&self) -> Result<Vec<Evidence>> {
        self.query_evidence(&format!("{} WHERE summary IS NULL ORDER BY seq ASC", SELECT_EVIDENCE))
    }

    fn query_evidence(&self, sql: &str) -> Result<Vec<Evidence>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(Self::row_to_evidence(row)?);
        }
        Ok(results)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM evidence", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Raw output, read from the index or the external file
    pub fn load_output(&self, evidence: &Evidence) -> Result<String> {
        match &evidence.location {
            EvidenceLocation::Inline { output } => Ok(output.clone()),
            EvidenceLocation::External { path } => Ok(std::fs::read_to_string(path)?),
        }
    }

    /// Fill in the summary of a record that has none yet
    pub fn update_summary(&self, id: &str, summary: &str, findings: &[String]) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE evidence SET summary = ?1, key_findings = ?2 WHERE id = ?3 AND summary IS NULL",
            params![summary, serde_json::to_string(findings)?, id],
        )?;
        if updated == 1 {
            return Ok(());
        }

        let exists = conn
            .query_row("SELECT 1 FROM evidence WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Err(StoreError::AlreadySummarized(id.to_string()))
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    pub fn merge_metadata(&self, id: &str, entries: Map<String, Value>) -> Result<()> {
        let conn = self.lock();
        let current: String = conn
            .query_row("SELECT metadata FROM evidence WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut metadata: Map<String, Value> = serde_json::from_str(&current)?;
        metadata.extend(entries);
        conn.execute(
            "UPDATE evidence SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id],
        )?;
        Ok(())
    }

    pub fn update_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE evidence SET embedding = ?1 WHERE id = ?2",
            params![serde_json::to_string(embedding)?, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace the chunk index of one record
    pub fn store_chunks(&self, evidence_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE evidence_id = ?1", params![evidence_id])?;
        for chunk in chunks {
            let finding = chunk.finding.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO chunks (evidence_id, seq, text, finding) VALUES (?1, ?2, ?3, ?4)",
                params![evidence_id, chunk.seq as i64, chunk.text, finding],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn chunks(&self, evidence_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT seq, text, finding FROM chunks WHERE evidence_id = ?1 ORDER BY seq")?;
        let mut rows = stmt.query(params![evidence_id])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            let finding: Option<String> = row.get(2)?;
            let finding: Option<ChunkFinding> = finding.map(|f| serde_json::from_str(&f)).transpose()?;
            chunks.push(Chunk {
                seq: row.get::<_, i64>(0)? as usize,
                text: row.get(1)?,
                finding,
            });
        }
        Ok(chunks)
    }

    fn row_to_evidence(row: &rusqlite::Row) -> Result<Evidence> {
        let storage: String = row.get(6)?;
        let location = if storage == "external" {
            EvidenceLocation::External {
                path: PathBuf::from(row.get::<_, String>(8)?),
            }
        } else {
            EvidenceLocation::Inline {
                output: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            }
        };
        let embedding: Option<String> = row.get(11)?;

        Ok(Evidence {
            seq: row.get(0)?,
            id: row.get(1)?,
            session_id: row.get(2)?,
            command: row.get(3)?,
            output_hash: row.get(4)?,
            size: row.get::<_, i64>(5)? as u64,
            location,
            summary: row.get(9)?,
            key_findings: serde_json::from_str(&row.get::<_, String>(10)?)?,
            embedding: embedding.map(|e| serde_json::from_str(&e)).transpose()?,
            metadata: serde_json::from_str(&row.get::<_, String>(12)?)?,
            created_at: row.get::<_, String>(13)?.parse()?,
        })
    }
}

/// Hex sha256 of raw output bytes
pub fn output_hash(output: &str) -> String {
    format!("{:x}", Sha256::digest(output.as_bytes()))
}

/// `ev_<command prefix>_<fingerprint>`, stable for a (session, command, output) triple
pub fn evidence_id(session_id: &str, command: &str, output_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(command.as_bytes());
    hasher.update([0u8]);
    hasher.update(output_hash.as_bytes());
    let fingerprint = format!("{:x}", hasher.finalize());

    let mut prefix: String = command
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .chars()
        .take(ID_PREFIX_LEN)
        .collect();
    if prefix.is_empty() {
        prefix.push_str("cmd");
    }
    format!("ev_{}_{}", prefix, &fingerprint[..FINGERPRINT_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path, options: StoreOptions) -> EvidenceStore {
        EvidenceStore::open_at(&dir.join("evidence.db"), dir.join("evidence"), "session_test", options)
            .unwrap()
    }

    #[test]
    fn test_put_then_get_inline() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(temp.path(), StoreOptions::default());

        let evidence_ref = store.put("!threads", "ThreadCount: 3\n").unwrap();
        assert_eq!(evidence_ref.status, PutStatus::Created);

        let evidence = store.get(&evidence_ref.id).unwrap().unwrap();
        assert_eq!(evidence.command, "!threads");
        assert_eq!(evidence.inline_output(), Some("ThreadCount: 3\n"));
        assert!(evidence.needs_analysis());
        assert!(evidence.metadata_str("timestamp").is_some());
    }

    #[test]
    fn test_large_output_goes_external() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(
            temp.path(),
            StoreOptions {
                inline_threshold: 16,
                dedup_window: None,
            },
        );
        let output = "0123456789\n".repeat(10);

        let evidence_ref = store.put("!dumpheap -stat", &output).unwrap();
        let evidence = store.require(&evidence_ref.id).unwrap();
        assert!(evidence.is_external());
        assert_eq!(evidence.size, output.len() as u64);
        assert_eq!(store.load_output(&evidence).unwrap(), output);
    }

    #[test]
    fn test_failed_insert_leaves_no_external_file() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(
            temp.path(),
            StoreOptions {
                inline_threshold: 16,
                dedup_window: None,
            },
        );
        let blocker = Connection::open(temp.path().join("evidence.db")).unwrap();
        blocker
            .execute_batch(
                "CREATE TRIGGER reject_evidence BEFORE INSERT ON evidence
                 BEGIN SELECT RAISE(ABORT, 'disk quota exceeded'); END;",
            )
            .unwrap();

        let result = store.put("!dumpheap -stat", &"0123456789\n".repeat(10));
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(std::fs::read_dir(temp.path().join("evidence")).unwrap().count(), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_dedup_identical_output() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(temp.path(), StoreOptions::default());

        let first = store.put("!threads", "same").unwrap();
        let second = store.put("!threads", "same").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, PutStatus::NeedsAnalysis);
        assert_eq!(store.count().unwrap(), 1);

        store.update_summary(&first.id, "3 threads", &[]).unwrap();
        let third = store.put("!threads", "same").unwrap();
        assert_eq!(third.status, PutStatus::Reused);
    }

    #[test]
    fn test_different_output_is_new_record() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(temp.path(), StoreOptions::default());

        let first = store.put("!threads", "ThreadCount: 3").unwrap();
        let second = store.put("!threads", "ThreadCount: 4").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.list().unwrap()[0].id, second.id);
    }

    #[test]
    fn test_stale_duplicate_outside_window() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(
            temp.path(),
            StoreOptions {
                inline_threshold: 1024,
                dedup_window: Some(Duration::seconds(-1)),
            },
        );

        let first = store.put("!syncblk", "Total 2").unwrap();
        let second = store.put("!syncblk", "Total 2").unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.id.starts_with(&first.id));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_update_summary_only_once() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(temp.path(), StoreOptions::default());
        let id = store.put("!threads", "x").unwrap().id;

        store
            .update_summary(&id, "summary", &["finding".to_string()])
            .unwrap();
        assert!(matches!(
            store.update_summary(&id, "again", &[]),
            Err(StoreError::AlreadySummarized(_))
        ));
        assert!(matches!(
            store.update_summary("ev_missing", "x", &[]),
            Err(StoreError::NotFound(_))
        ));

        let evidence = store.require(&id).unwrap();
        assert_eq!(evidence.summary.as_deref(), Some("summary"));
        assert_eq!(evidence.key_findings, vec!["finding".to_string()]);
        assert!(store.pending_analysis().unwrap().is_empty());
    }

    #[test]
    fn test_chunks_and_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(temp.path(), StoreOptions::default());
        let id = store.put("!dumpheap", "a\nb\n").unwrap().id;

        store
            .store_chunks(
                &id,
                &[
                    Chunk {
                        seq: 0,
                        text: "a\n".to_string(),
                        finding: None,
                    },
                    Chunk {
                        seq: 1,
                        text: "b\n".to_string(),
                        finding: Some(ChunkFinding::unavailable("timeout")),
                    },
                ],
            )
            .unwrap();
        let chunks = store.chunks(&id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].finding.as_ref().map(|f| f.available), Some(false));

        let mut entries = Map::new();
        entries.insert("intent".to_string(), Value::String("heap growth".to_string()));
        store.merge_metadata(&id, entries).unwrap();
        store.update_embedding(&id, &[0.5, 0.25]).unwrap();

        let evidence = store.require(&id).unwrap();
        assert_eq!(evidence.metadata_str("intent"), Some("heap growth"));
        assert!(evidence.metadata_str("timestamp").is_some());
        assert_eq!(evidence.embedding, Some(vec![0.5, 0.25]));
    }

    #[test]
    fn test_evidence_id_shape() {
        let hash = output_hash("out");
        let id = evidence_id("s1", "!dumpheap -mt 00007ff8a1b2c4e0", &hash);
        assert!(id.starts_with("ev_dumpheap__mt_00007ff_"));
        assert_eq!(id, evidence_id("s1", "!dumpheap -mt 00007ff8a1b2c4e0", &hash));
        assert_ne!(id, evidence_id("s2", "!dumpheap -mt 00007ff8a1b2c4e0", &hash));
    }

    #[test]
    fn test_reopen_preserves_records() {
        let temp = tempfile::tempdir().unwrap();
        let id = {
            let store = store_in(temp.path(), StoreOptions::default());
            store.put("!threads", "x").unwrap().id
        };
        let store = store_in(temp.path(), StoreOptions::default());
        assert_eq!(store.put("!threads", "x").unwrap().id, id);
    }
}
