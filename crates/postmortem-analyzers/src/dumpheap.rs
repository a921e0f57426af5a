//! `!dumpheap` parser: per-type statistics and object listings

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

static STAT_RE: OnceLock<Regex> = OnceLock::new();
static OBJECT_RE: OnceLock<Regex> = OnceLock::new();

const TOP_TYPES: usize = 5;
const TOP_OBJECTS: usize = 3;
/// Share of total heap size above which one type is called out as dominant
const DOMINANT_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Serialize)]
struct TypeStat {
    method_table: String,
    count: u64,
    total_size: u64,
    class_name: String,
}

#[derive(Debug, Clone, Serialize)]
struct HeapObject {
    address: String,
    method_table: String,
    size: u64,
}

pub struct DumpHeapAnalyzer;

impl CommandAnalyzer for DumpHeapAnalyzer {
    fn name(&self) -> &str {
        "dumpheap"
    }

    fn description(&self) -> &str {
        "Managed heap statistics and object listings"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(command, "!dumpheap")
    }

    fn analyze(&self, command: &str, output: &str, _ctx: &AnalysisContext) -> Option<Analysis> {
        let stats = parse_stats(output);
        let objects = parse_objects(output);
        let wants_stats = command.to_lowercase().contains("-stat");

        let (summary, findings, details) = if wants_stats || objects.is_empty() {
            if stats.is_empty() {
                return None;
            }
            summarize_stats(&stats)
        } else {
            summarize_objects(command, &objects, &stats)
        };

        Some(Analysis {
            analyzer: self.name().to_string(),
            tier: Tier::Parse,
            summary,
            findings,
            details,
        })
    }
}

fn summarize_stats(stats: &[TypeStat]) -> (String, Vec<String>, serde_json::Value) {
    let total_objects: u64 = stats.iter().map(|s| s.count).sum();
    let total_size: u64 = stats.iter().map(|s| s.total_size).sum();

    let mut by_size = stats.to_vec();
    by_size.sort_by(|a, b| b.total_size.cmp(&a.total_size));
    let mut by_count = stats.to_vec();
    by_count.sort_by(|a, b| b.count.cmp(&a.count));

    let mut summary = format!(
        "Heap holds {} objects across {} types, {} bytes total.",
        total_objects,
        stats.len(),
        total_size
    );
    if let Some(top) = by_size.first() {
        summary.push_str(&format!(
            " Largest type by size: {} ({} bytes in {} objects).",
            top.class_name, top.total_size, top.count
        ));
    }

    let mut findings: Vec<String> = by_size
        .iter()
        .take(TOP_TYPES)
        .map(|s| {
            format!(
                "{} (MT {}): {} objects, {} bytes",
                s.class_name, s.method_table, s.count, s.total_size
            )
        })
        .collect();
    if let Some(top) = by_size.first() {
        if total_size > 0 && top.total_size as f64 / total_size as f64 >= DOMINANT_SHARE {
            findings.push(format!(
                "{} dominates the heap at {:.0}% of total size",
                top.class_name,
                100.0 * top.total_size as f64 / total_size as f64
            ));
        }
    }
    if let Some(top) = by_count.first() {
        findings.push(format!("Most numerous type: {} ({} objects)", top.class_name, top.count));
    }

    let details = serde_json::json!({
        "total_objects": total_objects,
        "total_size": total_size,
        "top_by_size": by_size.iter().take(TOP_TYPES).collect::<Vec<_>>(),
        "top_by_count": by_count.iter().take(TOP_TYPES).collect::<Vec<_>>(),
    });
    (summary, findings, details)
}

fn summarize_objects(
    command: &str,
    objects: &[HeapObject],
    stats: &[TypeStat],
) -> (String, Vec<String>, serde_json::Value) {
    let total_size: u64 = objects.iter().map(|o| o.size).sum();
    let type_name = type_filter(command)
        .or_else(|| (stats.len() == 1).then(|| stats[0].class_name.clone()))
        .unwrap_or_else(|| "listed types".to_string());

    let mut largest = objects.to_vec();
    largest.sort_by(|a, b| b.size.cmp(&a.size));

    let mut summary = format!(
        "{} objects of {}, {} bytes total.",
        objects.len(),
        type_name,
        total_size
    );
    if let Some(top) = largest.first() {
        summary.push_str(&format!(" Largest is 0x{} ({} bytes).", top.address, top.size));
    }

    let findings = largest
        .iter()
        .take(TOP_OBJECTS)
        .map(|o| format!("Object 0x{} (MT {}) size {}", o.address, o.method_table, o.size))
        .collect();

    let details = serde_json::json!({
        "object_count": objects.len(),
        "total_size": total_size,
        "largest": largest.iter().take(TOP_OBJECTS).collect::<Vec<_>>(),
    });
    (summary, findings, details)
}

fn parse_stats(output: &str) -> Vec<TypeStat> {
    let re = STAT_RE
        .get_or_init(|| Regex::new(r"^([0-9a-fA-F]{8,16})\s+(\d+)\s+(\d+)\s+(.+)$").unwrap());
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(TypeStat {
                method_table: caps[1].to_lowercase(),
                count: caps[2].parse().ok()?,
                total_size: caps[3].parse().ok()?,
                class_name: caps[4].trim().to_string(),
            })
        })
        .collect()
}

fn parse_objects(output: &str) -> Vec<HeapObject> {
    let re = OBJECT_RE.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{8,16})\s+([0-9a-fA-F]{8,16})\s+(\d+)\s*(?:\S+)?$").unwrap()
    });
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(HeapObject {
                address: caps[1].to_lowercase(),
                method_table: caps[2].to_lowercase(),
                size: caps[3].parse().ok()?,
            })
        })
        .collect()
}

fn type_filter(command: &str) -> Option<String> {
    let mut parts = command.split_whitespace();
    while let Some(part) = parts.next() {
        if part.eq_ignore_ascii_case("-type") {
            return parts.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_OUTPUT: &str = "\
Statistics:
              MT    Count    TotalSize Class Name
00007ff8a1b2c3d0        1           24 System.Collections.Generic.GenericEqualityComparer`1[[System.String, System.Private.CoreLib]]
00007ff8a1b2c4e0    12000       960000 System.Byte[]
00007ff8a1b2c5f0    40000       800000 System.String
00007ff8a1b2c600      300        24000 MyApp.Cache.Entry
Total 52301 objects
";

    const OBJECT_OUTPUT: &str = "\
         Address               MT     Size
000001f2a3b4c5d6 00007ff8a1b2c4e0      100
000001f2a3b4c700 00007ff8a1b2c4e0      500
000001f2a3b4c900 00007ff8a1b2c4e0       10

Statistics:
              MT    Count    TotalSize Class Name
00007ff8a1b2c4e0        3          610 System.Byte[]
Total 3 objects
";

    #[test]
    fn test_stat_summary() {
        let ctx = AnalysisContext::new();
        let analysis = DumpHeapAnalyzer
            .analyze("!dumpheap -stat", STAT_OUTPUT, &ctx)
            .unwrap();

        assert!(analysis.summary.contains("52301 objects across 4 types"));
        assert!(analysis.summary.contains("Largest type by size: System.Byte[]"));
        assert!(analysis.findings[0].starts_with("System.Byte[] (MT 00007ff8a1b2c4e0)"));
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.starts_with("System.Byte[] dominates the heap")));
        assert!(analysis
            .findings
            .contains(&"Most numerous type: System.String (40000 objects)".to_string()));
    }

    #[test]
    fn test_object_listing_ranks_by_size() {
        let ctx = AnalysisContext::new();
        let analysis = DumpHeapAnalyzer
            .analyze("!dumpheap -type System.Byte[]", OBJECT_OUTPUT, &ctx)
            .unwrap();

        assert!(analysis.summary.starts_with("3 objects of System.Byte[], 610 bytes"));
        assert!(analysis.summary.contains("Largest is 0x000001f2a3b4c700 (500 bytes)"));
        assert_eq!(analysis.findings.len(), 3);
        assert!(analysis.findings[0].contains("000001f2a3b4c700"));
    }

    #[test]
    fn test_unrecognized_output() {
        let ctx = AnalysisContext::new();
        assert!(DumpHeapAnalyzer
            .analyze("!dumpheap -stat", "The garbage collector data structures are not in a valid state", &ctx)
            .is_none());
    }
}
