//! Per-session lookup state shared between analyzers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One row of the managed thread table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEntry {
    /// Debugger thread number; `None` for dead threads (`XXXX`)
    pub dbg_id: Option<u32>,
    pub managed_id: u32,
    /// OS thread id, lowercase hex without prefix
    pub osid: String,
    pub lock_count: u32,
    pub apartment: String,
    pub exception: Option<String>,
    /// Role annotation such as `Finalizer` or `Threadpool Worker`
    pub special: Option<String>,
}

impl ThreadEntry {
    pub fn is_dead(&self) -> bool {
        self.dbg_id.is_none()
    }

    pub fn label(&self) -> String {
        match self.dbg_id {
            Some(dbg) => format!("thread {} (managed {}, OSID 0x{})", dbg, self.managed_id, self.osid),
            None => format!("dead thread (managed {})", self.managed_id),
        }
    }
}

/// Maps managed ids and OS ids to debugger thread numbers
#[derive(Debug, Clone, Default)]
pub struct ThreadTable {
    by_managed: BTreeMap<u32, ThreadEntry>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with a fresh listing
    pub fn replace(&mut self, threads: impl IntoIterator<Item = ThreadEntry>) {
        self.by_managed.clear();
        for thread in threads {
            self.by_managed.insert(thread.managed_id, thread);
        }
    }

    pub fn by_managed_id(&self, managed_id: u32) -> Option<&ThreadEntry> {
        self.by_managed.get(&managed_id)
    }

    pub fn by_osid(&self, osid: &str) -> Option<&ThreadEntry> {
        let wanted = osid.trim_start_matches("0x").to_lowercase();
        self.by_managed.values().find(|t| t.osid == wanted)
    }

    pub fn by_dbg_id(&self, dbg_id: u32) -> Option<&ThreadEntry> {
        self.by_managed.values().find(|t| t.dbg_id == Some(dbg_id))
    }

    pub fn len(&self) -> usize {
        self.by_managed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_managed.is_empty()
    }
}

/// Explicit per-session context handed to every analyzer call
#[derive(Debug, Default)]
pub struct AnalysisContext {
    threads: Mutex<ThreadTable>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(&self) -> MutexGuard<'_, ThreadTable> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
