//! `!threads` parser: thread counts, lock holders, exceptions, special threads

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::{AnalysisContext, ThreadEntry};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static STAT_RE: OnceLock<Regex> = OnceLock::new();
static ROW_RE: OnceLock<Regex> = OnceLock::new();

const STAT_KEYS: &[&str] = &[
    "ThreadCount",
    "UnstartedThread",
    "BackgroundThread",
    "PendingThread",
    "DeadThread",
];

pub struct ThreadsAnalyzer;

impl CommandAnalyzer for ThreadsAnalyzer {
    fn name(&self) -> &str {
        "threads"
    }

    fn description(&self) -> &str {
        "Managed thread table: counts, lock holders, exceptions, finalizer"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(command, "!threads") || command_is(command, "!t")
    }

    fn analyze(&self, _command: &str, output: &str, ctx: &AnalysisContext) -> Option<Analysis> {
        let stats = parse_stats(output);
        let threads = parse_rows(output);
        if stats.is_empty() && threads.is_empty() {
            return None;
        }

        let total = stats
            .get("ThreadCount")
            .copied()
            .unwrap_or(threads.len() as u64);
        let background = stats.get("BackgroundThread").copied().unwrap_or(0);
        let dead = stats
            .get("DeadThread")
            .copied()
            .unwrap_or_else(|| threads.iter().filter(|t| t.is_dead()).count() as u64);

        let lock_holders: Vec<&ThreadEntry> = threads.iter().filter(|t| t.lock_count > 0).collect();
        let finalizer = threads.iter().find(|t| has_role(t, "finalizer"));
        let gc_threads = threads.iter().filter(|t| has_role(t, "gc")).count();

        let mut summary = format!("Found {} threads in the process.", total);
        if background > 0 {
            summary.push_str(&format!(" {} are background threads.", background));
        }
        if dead > 0 {
            summary.push_str(&format!(" {} are dead threads.", dead));
        }
        if !lock_holders.is_empty() {
            summary.push_str(&format!(" {} threads hold locks.", lock_holders.len()));
        }

        let mut findings = vec![
            format!("Total threads: {}", total),
            format!(
                "Foreground: {}, Background: {}",
                total.saturating_sub(background),
                background
            ),
        ];
        if dead > 0 {
            findings.push(format!("Dead threads: {}", dead));
        }
        for thread in &lock_holders {
            findings.push(format!("{} holds {} lock(s)", thread.label(), thread.lock_count));
        }
        for thread in threads.iter().filter(|t| t.exception.is_some()) {
            if let Some(exception) = &thread.exception {
                findings.push(format!("{} has exception {}", thread.label(), exception));
            }
        }
        if let Some(thread) = finalizer {
            findings.push(format!("Finalizer is {}", thread.label()));
        }
        if gc_threads > 0 {
            findings.push(format!("{} GC threads", gc_threads));
        }

        let details = serde_json::json!({
            "stats": stats,
            "threads": threads,
        });

        ctx.threads().replace(threads);

        Some(Analysis {
            analyzer: self.name().to_string(),
            tier: Tier::Parse,
            summary,
            findings,
            details,
        })
    }
}

fn has_role(thread: &ThreadEntry, role: &str) -> bool {
    thread
        .special
        .as_deref()
        .map(|s| s.to_lowercase().contains(role))
        .unwrap_or(false)
}

fn parse_stats(output: &str) -> BTreeMap<String, u64> {
    let re = STAT_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([A-Za-z]+):\s+(\d+)\s*$").unwrap()
    });
    re.captures_iter(output)
        .filter(|c| STAT_KEYS.contains(&&c[1]))
        .filter_map(|c| Some((c[1].to_string(), c[2].parse().ok()?)))
        .collect()
}

fn parse_rows(output: &str) -> Vec<ThreadEntry> {
    let re = ROW_RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d+|XXXX)\s+(\d+)\s+([0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+(\w+)\s+([0-9a-fA-F]+:[0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+(\d+)\s+(\w+)(?:\s+(.+?))?\s*$",
        )
        .unwrap()
    });

    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim_end_matches('\r'))?;
            let (special, exception) = split_exception_column(caps.get(11).map(|m| m.as_str()));
            Some(ThreadEntry {
                dbg_id: caps[1].parse().ok(),
                managed_id: caps[2].parse().ok()?,
                osid: caps[3].to_lowercase(),
                lock_count: caps[9].parse().unwrap_or(0),
                apartment: caps[10].to_string(),
                exception,
                special,
            })
        })
        .collect()
}

/// `(Finalizer)`, `System.Exception 0000...`, or both
fn split_exception_column(column: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(column) = column.map(str::trim).filter(|c| !c.is_empty()) else {
        return (None, None);
    };

    if let Some(rest) = column.strip_prefix('(') {
        if let Some(end) = rest.find(')') {
            let special = rest[..end].trim().to_string();
            let remainder = rest[end + 1..].trim();
            let exception = (!remainder.is_empty()).then(|| remainder.to_string());
            return (Some(special), exception);
        }
    }
    (None, Some(column.to_string()))
}
