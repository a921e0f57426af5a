//! `!threadpool` parser: worker saturation, queue backlog, completion ports

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

struct Patterns {
    cpu: Regex,
    workers_total: Regex,
    workers_running: Regex,
    workers_idle: Regex,
    workers_max: Regex,
    completion: Regex,
    queued: Regex,
    timers: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        cpu: Regex::new(r"(?i)CPU utilization:\s*(\d+)\s*%").unwrap(),
        // classic single-line layout and the one-field-per-line layout of newer SOS
        workers_total: Regex::new(r"(?i)(?:Worker Thread:\s*Total|Workers Total):\s*(\d+)").unwrap(),
        workers_running: Regex::new(r"(?i)(?:Worker Thread:.*?\bRunning|Workers Running):\s*(\d+)").unwrap(),
        workers_idle: Regex::new(r"(?i)(?:Worker Thread:.*?\bIdle|Workers Idle):\s*(\d+)").unwrap(),
        workers_max: Regex::new(r"(?i)(?:Worker Thread:.*?\bMaxLimit|Max Limit Workers):\s*(\d+)").unwrap(),
        completion: Regex::new(r"(?i)Completion Port Thread:\s*Total:\s*(\d+)\s*Free:\s*(\d+)").unwrap(),
        queued: Regex::new(r"(?i)Work Request in Queue:\s*(\d+)").unwrap(),
        timers: Regex::new(r"(?i)Number of Timers:\s*(\d+)").unwrap(),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
struct PoolStats {
    cpu_utilization: Option<u32>,
    workers_total: Option<u32>,
    workers_running: u32,
    workers_idle: u32,
    workers_max: Option<u32>,
    completion_total: Option<u32>,
    completion_free: Option<u32>,
    queued: u32,
    timers: Option<u32>,
}

impl PoolStats {
    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.queued > 0 {
            issues.push(format!("Work queue backlog: {} item(s)", self.queued));
        }
        if let Some(total) = self.workers_total.filter(|&t| t > 0) {
            if self.workers_idle == 0 {
                issues.push("No idle worker threads, possible starvation".to_string());
            }
            if self.workers_running >= total {
                issues.push(format!("All {} worker threads busy", total));
            }
        }
        if let Some(cpu) = self.cpu_utilization.filter(|&c| c >= 90) {
            issues.push(format!("CPU utilization at {}%", cpu));
        }
        issues
    }
}

pub struct ThreadPoolAnalyzer;

impl CommandAnalyzer for ThreadPoolAnalyzer {
    fn name(&self) -> &str {
        "threadpool"
    }

    fn description(&self) -> &str {
        "Thread pool health: worker saturation and queued work"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(command, "!threadpool") || command_is(command, "!tp")
    }

    fn analyze(&self, _command: &str, output: &str, _ctx: &AnalysisContext) -> Option<Analysis> {
        let stats = parse_stats(output)?;
        let issues = stats.issues();

        let summary = if issues.is_empty() {
            format!(
                "Thread pool healthy: {} idle worker(s), {} queued item(s).",
                stats.workers_idle, stats.queued
            )
        } else {
            let head: Vec<&str> = issues.iter().take(2).map(String::as_str).collect();
            format!("Thread pool under pressure: {}.", head.join("; "))
        };

        let mut findings = Vec::new();
        if let Some(cpu) = stats.cpu_utilization {
            findings.push(format!("CPU utilization: {}%", cpu));
        }
        if let Some(total) = stats.workers_total {
            let mut line = format!(
                "Worker threads: {} running, {} idle, {} total",
                stats.workers_running, stats.workers_idle, total
            );
            if let Some(max) = stats.workers_max {
                line.push_str(&format!(" (max {})", max));
            }
            findings.push(line);
        }
        if let (Some(total), Some(free)) = (stats.completion_total, stats.completion_free) {
            findings.push(format!("Completion port threads: {} free of {}", free, total));
        }
        findings.push(format!("Work queue depth: {}", stats.queued));
        if let Some(timers) = stats.timers {
            findings.push(format!("Timers: {}", timers));
        }
        findings.extend(issues.iter().cloned());

        let details = serde_json::json!({
            "stats": stats,
            "issues": issues,
        });

        Some(Analysis {
            analyzer: self.name().to_string(),
            tier: Tier::Parse,
            summary,
            findings,
            details,
        })
    }
}

fn capture_u32(re: &Regex, output: &str) -> Option<u32> {
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

/// `None` when neither CPU nor worker figures are present
fn parse_stats(output: &str) -> Option<PoolStats> {
    let p = patterns();
    let stats = PoolStats {
        cpu_utilization: capture_u32(&p.cpu, output),
        workers_total: capture_u32(&p.workers_total, output),
        workers_running: capture_u32(&p.workers_running, output).unwrap_or(0),
        workers_idle: capture_u32(&p.workers_idle, output).unwrap_or(0),
        workers_max: capture_u32(&p.workers_max, output),
        completion_total: p.completion.captures(output).and_then(|c| c[1].parse().ok()),
        completion_free: p.completion.captures(output).and_then(|c| c[2].parse().ok()),
        queued: capture_u32(&p.queued, output).unwrap_or(0),
        timers: capture_u32(&p.timers, output),
    };
    if stats.cpu_utilization.is_none() && stats.workers_total.is_none() {
        return None;
    }
    Some(stats)
}
