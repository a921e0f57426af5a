//! Known failure patterns used as hints when forming hypotheses

use serde::{Deserialize, Serialize};
use std::path::Path;

const SYMPTOM_WEIGHT: f64 = 0.3;
const NAME_WEIGHT: f64 = 0.2;
const ROOT_CAUSE_WEIGHT: f64 = 0.15;
const FOCUS_WEIGHT: f64 = 0.1;

const STOP_WORDS: &[&str] = &[
    "the", "and", "but", "for", "with", "from", "been", "have", "does", "will", "would", "should", "could",
    "might", "must", "that", "this", "when", "into", "than", "then", "they", "them", "their", "there",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPattern {
    pub name: String,
    pub symptoms: String,
    pub root_cause: String,
    #[serde(default)]
    pub investigation_focus: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub pattern: KnownPattern,
    /// 0.0..=1.0
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct PatternFile {
    patterns: Vec<KnownPattern>,
}

struct BuiltinPattern {
    name: &'static str,
    symptoms: &'static str,
    root_cause: &'static str,
    investigation_focus: &'static str,
    severity: &'static str,
}

const BUILTIN_PATTERNS: &[BuiltinPattern] = &[
    BuiltinPattern {
        name: "Sync-over-async deadlock",
        symptoms: "application hangs, requests never complete, threads blocked waiting on Task.Result or Wait",
        root_cause: "blocking on asynchronous work while holding a synchronization context",
        investigation_focus: "clrstack of blocked threads, look for Task.Wait, GetResult and SynchronizationContext",
        severity: "HIGH",
    },
    BuiltinPattern {
        name: "Thread pool starvation",
        symptoms: "slow responses, growing request queue, many worker threads blocked, high thread count",
        root_cause: "worker threads blocked on synchronous I/O or locks so queued work cannot run",
        investigation_focus: "threadpool queue length, blocked worker stacks, threads count",
        severity: "HIGH",
    },
    BuiltinPattern {
        name: "Lock contention",
        symptoms: "hang or high latency, threads waiting on monitor, syncblk shows waiters",
        root_cause: "a long-held monitor or lock convoy serializes worker threads",
        investigation_focus: "syncblk owner thread and its stack, waiting threads",
        severity: "HIGH",
    },
    BuiltinPattern {
        name: "Blocked finalizer",
        symptoms: "memory grows steadily, finalize queue large, finalizer thread blocked",
        root_cause: "a finalizer waits on a lock or STA thread so finalizable objects are never released",
        investigation_focus: "finalizer thread stack, finalizequeue counts",
        severity: "MEDIUM",
    },
    BuiltinPattern {
        name: "Managed memory leak",
        symptoms: "out of memory, memory usage grows, large heap, many strings or byte arrays",
        root_cause: "objects kept reachable by static caches, event handlers or long-lived collections",
        investigation_focus: "dumpheap statistics, gcroot of the largest objects",
        severity: "HIGH",
    },
    BuiltinPattern {
        name: "Unhandled exception crash",
        symptoms: "process crash, unexpected termination, exception on a thread",
        root_cause: "an exception escaped a thread or finalizer and terminated the process",
        investigation_focus: "printexception on the faulting thread, exception stack",
        severity: "CRITICAL",
    },
];

#[derive(Debug, Clone, Default)]
pub struct PatternLibrary {
    patterns: Vec<KnownPattern>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<KnownPattern>) -> Self {
        Self { patterns }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_PATTERNS
                .iter()
                .map(|p| KnownPattern {
                    name: p.name.to_string(),
                    symptoms: p.symptoms.to_string(),
                    root_cause: p.root_cause.to_string(),
                    investigation_focus: p.investigation_focus.to_string(),
                    severity: p.severity.to_string(),
                })
                .collect(),
        )
    }

    /// Load `{"patterns": [...]}` from a JSON file
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: PatternFile = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(file.patterns))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Best `limit` patterns for an issue description, highest score first
    pub fn lookup(&self, issue: &str, limit: usize) -> Vec<PatternMatch> {
        let issue = issue.to_lowercase();
        let mut matches: Vec<PatternMatch> = self
            .patterns
            .iter()
            .map(|pattern| PatternMatch {
                pattern: pattern.clone(),
                score: score(pattern, &issue),
            })
            .filter(|m| m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        matches
    }
}

fn score(pattern: &KnownPattern, issue_lower: &str) -> f64 {
    let hits = |text: &str| {
        keywords(text)
            .iter()
            .filter(|kw| issue_lower.contains(kw.as_str()))
            .count() as f64
    };

    let total = SYMPTOM_WEIGHT * hits(&pattern.symptoms)
        + NAME_WEIGHT * hits(&pattern.name)
        + ROOT_CAUSE_WEIGHT * hits(&pattern.root_cause)
        + FOCUS_WEIGHT * hits(&pattern.investigation_focus);
    total.min(1.0)
}

fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect();
    out.dedup();
    out
}

/// Prompt block describing the matched patterns
pub fn format_hints(matches: &[PatternMatch]) -> String {
    if matches.is_empty() {
        return String::new();
    }
    let mut hints = String::from("Known patterns worth checking first:\n");
    for (i, m) in matches.iter().enumerate() {
        hints.push_str(&format!(
            "{}. {} (relevance {:.0}%)\n   Symptoms: {}\n   Root cause: {}\n",
            i + 1,
            m.pattern.name,
            m.score * 100.0,
            m.pattern.symptoms,
            m.pattern.root_cause
        ));
        if !m.pattern.investigation_focus.is_empty() {
            hints.push_str(&format!("   Focus: {}\n", m.pattern.investigation_focus));
        }
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ranks_matching_pattern_first() {
        let library = PatternLibrary::builtin();
        let matches = library.lookup("service hangs and the syncblk output shows waiters on a monitor", 3);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].pattern.name, "Lock contention");
        assert!(matches[0].score <= 1.0);
    }

    #[test]
    fn test_lookup_unrelated_issue() {
        let library = PatternLibrary::builtin();
        assert!(library.lookup("xyz", 3).is_empty());
    }

    #[test]
    fn test_score_weights() {
        let pattern = KnownPattern {
            name: "Alpha".to_string(),
            symptoms: "zebra".to_string(),
            root_cause: "gamma".to_string(),
            investigation_focus: "delta".to_string(),
            severity: String::new(),
        };
        assert!((score(&pattern, "zebra") - 0.3).abs() < 1e-9);
        assert!((score(&pattern, "alpha gamma") - 0.35).abs() < 1e-9);
        assert!((score(&pattern, "zebra alpha gamma delta") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_from_json_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("patterns.json");
        std::fs::write(
            &path,
            r#"{"patterns": [{"name": "Socket exhaustion", "symptoms": "connection failures", "root_cause": "sockets not disposed"}]}"#,
        )
        .unwrap();
        let library = PatternLibrary::from_json_file(&path).unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library.lookup("random connection failures", 1)[0].pattern.name, "Socket exhaustion");
    }

    #[test]
    fn test_format_hints() {
        let library = PatternLibrary::builtin();
        let hints = format_hints(&library.lookup("finalizer thread blocked, memory grows", 1));
        assert!(hints.contains("Blocked finalizer"));
        assert!(format_hints(&[]).is_empty());
    }
}
