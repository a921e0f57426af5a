//! `!finalizequeue` parser: finalizable objects per generation and the types behind them

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

static HEAP_RE: OnceLock<Regex> = OnceLock::new();
static GENERATION_RE: OnceLock<Regex> = OnceLock::new();
static READY_RE: OnceLock<Regex> = OnceLock::new();
static SYNCBLOCKS_RE: OnceLock<Regex> = OnceLock::new();
static STAT_ROW_RE: OnceLock<Regex> = OnceLock::new();

const GEN2_BACKLOG: u64 = 10_000;
const READY_BACKLOG: u64 = 1_000;
const TOTAL_BACKLOG: u64 = 50_000;
const TOP_TYPES: usize = 3;

#[derive(Debug, Clone, Default, Serialize)]
struct HeapQueue {
    heap: u32,
    generations: [u64; 3],
    ready: u64,
}

#[derive(Debug, Clone, Serialize)]
struct FinalizableType {
    method_table: String,
    count: u64,
    total_size: u64,
    class_name: String,
}

pub struct FinalizeQueueAnalyzer;

impl CommandAnalyzer for FinalizeQueueAnalyzer {
    fn name(&self) -> &str {
        "finalizequeue"
    }

    fn description(&self) -> &str {
        "Finalizer backlog by generation, with the most common finalizable types"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(command, "!finalizequeue") || command_is(command, "!fq")
    }

    fn analyze(&self, _command: &str, output: &str, _ctx: &AnalysisContext) -> Option<Analysis> {
        let heaps = parse_heaps(output);
        let syncblocks = parse_syncblocks(output);
        if heaps.is_empty() && syncblocks.is_none() {
            return None;
        }

        let mut generations = [0u64; 3];
        let mut ready = 0u64;
        for heap in &heaps {
            for (total, count) in generations.iter_mut().zip(heap.generations) {
                *total += count;
            }
            ready += heap.ready;
        }
        let total: u64 = generations.iter().sum();

        let mut issues = Vec::new();
        if generations[2] > GEN2_BACKLOG {
            issues.push(format!("{} finalizable objects already promoted to gen2", generations[2]));
        }
        if ready > READY_BACKLOG {
            issues.push(format!("{} objects waiting on the finalizer thread", ready));
        }
        if total > TOTAL_BACKLOG {
            issues.push(format!("{} finalizable objects in total", total));
        }

        let summary = if issues.is_empty() {
            format!("Finalizer queue normal: {} finalizable object(s), {} ready.", total, ready)
        } else {
            format!(
                "Finalizer queue backed up: {} finalizable object(s), {} in gen2, {} ready.",
                total, generations[2], ready
            )
        };

        let mut types = parse_types(output);
        types.sort_by(|a, b| b.count.cmp(&a.count));

        let mut findings = vec![
            format!(
                "Gen0: {}, Gen1: {}, Gen2: {} across {} heap(s)",
                generations[0],
                generations[1],
                generations[2],
                heaps.len()
            ),
            format!("Ready for finalization: {}", ready),
        ];
        if let Some(count) = syncblocks.filter(|&c| c > 0) {
            findings.push(format!("SyncBlocks to be cleaned up: {}", count));
        }
        findings.extend(issues.iter().cloned());
        findings.extend(
            types
                .iter()
                .take(TOP_TYPES)
                .map(|t| format!("{} instances of {} ({} bytes)", t.count, t.class_name, t.total_size)),
        );

        let details = serde_json::json!({
            "heaps": heaps,
            "totals": {"gen0": generations[0], "gen1": generations[1], "gen2": generations[2], "ready": ready, "total": total},
            "syncblocks_to_clean": syncblocks,
            "types": types,
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

/// Per-heap counters; single-heap output without a `Heap N` line counts as heap 0
fn parse_heaps(output: &str) -> Vec<HeapQueue> {
    let heap_re = HEAP_RE.get_or_init(|| Regex::new(r"^\s*Heap\s+(\d+)\s*$").unwrap());
    let gen_re = GENERATION_RE
        .get_or_init(|| Regex::new(r"generation\s+([0-2])\s+has\s+(\d+)\s+finalizable").unwrap());
    let ready_re = READY_RE.get_or_init(|| Regex::new(r"Ready for finalization\s+(\d+)").unwrap());

    let mut heaps: Vec<HeapQueue> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = heap_re.captures(line) {
            heaps.push(HeapQueue {
                heap: caps[1].parse().unwrap_or(0),
                ..HeapQueue::default()
            });
            continue;
        }
        if let Some(caps) = gen_re.captures(line) {
            if heaps.is_empty() {
                heaps.push(HeapQueue::default());
            }
            let generation: usize = caps[1].parse().unwrap_or(0);
            if let Some(heap) = heaps.last_mut() {
                heap.generations[generation] = caps[2].parse().unwrap_or(0);
            }
        } else if let Some(caps) = ready_re.captures(line) {
            if heaps.is_empty() {
                heaps.push(HeapQueue::default());
            }
            if let Some(heap) = heaps.last_mut() {
                heap.ready = caps[1].parse().unwrap_or(0);
            }
        }
    }
    heaps
}

fn parse_syncblocks(output: &str) -> Option<u64> {
    let re = SYNCBLOCKS_RE.get_or_init(|| Regex::new(r"SyncBlocks to be cleaned up:\s*(\d+)").unwrap());
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

fn parse_types(output: &str) -> Vec<FinalizableType> {
    let re = STAT_ROW_RE
        .get_or_init(|| Regex::new(r"^\s*([0-9a-fA-F]{8,16})\s+(\d+)\s+(\d+)\s+(\S.*?)\s*$").unwrap());
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            Some(FinalizableType {
                method_table: caps[1].to_lowercase(),
                count: caps[2].parse().ok()?,
                total_size: caps[3].parse().ok()?,
                class_name: caps[4].to_string(),
            })
        })
        .collect()
}
