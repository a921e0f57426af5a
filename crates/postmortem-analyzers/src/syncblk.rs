//! `!syncblk` parser: held monitors, owners and waiters

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
static TOTAL_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Serialize)]
struct SyncBlock {
    index: u32,
    syncblock: String,
    monitor_held: u32,
    recursion: u32,
    owner_osid: String,
    owner_dbg_id: Option<u32>,
    object: String,
    object_type: String,
}

impl SyncBlock {
    /// MonitorHeld counts 1 for the owner and 2 per waiter
    fn waiters(&self) -> u32 {
        self.monitor_held.saturating_sub(1) / 2
    }
}

pub struct SyncBlkAnalyzer;

impl CommandAnalyzer for SyncBlkAnalyzer {
    fn name(&self) -> &str {
        "syncblk"
    }

    fn description(&self) -> &str {
        "Held monitors with owning thread and waiter counts"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(command, "!syncblk")
    }

    fn analyze(&self, _command: &str, output: &str, ctx: &AnalysisContext) -> Option<Analysis> {
        let blocks = parse_blocks(output);
        let total = parse_total(output);
        if blocks.is_empty() && total.is_none() {
            return None;
        }

        let contended: Vec<&SyncBlock> = blocks.iter().filter(|b| b.waiters() > 0).collect();
        let summary = if blocks.is_empty() {
            "No monitors are currently held.".to_string()
        } else {
            format!(
                "{} monitor(s) held, {} contended with waiting threads.",
                blocks.len(),
                contended.len()
            )
        };

        let threads = ctx.threads();
        let mut findings: Vec<String> = blocks
            .iter()
            .map(|b| {
                let owner = threads
                    .by_osid(&b.owner_osid)
                    .map(|t| t.label())
                    .unwrap_or_else(|| match b.owner_dbg_id {
                        Some(dbg) => format!("thread {} (OSID 0x{})", dbg, b.owner_osid),
                        None => format!("dead thread (OSID 0x{})", b.owner_osid),
                    });
                format!(
                    "Monitor on {} (0x{}) held by {}, {} waiter(s), recursion {}",
                    b.object_type,
                    b.object,
                    owner,
                    b.waiters(),
                    b.recursion
                )
            })
            .collect();
        if let Some(total) = total {
            findings.push(format!("Sync block table size: {}", total));
        }

        let details = serde_json::json!({
            "blocks": blocks,
            "total": total,
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

fn parse_blocks(output: &str) -> Vec<SyncBlock> {
    let re = BLOCK_RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d+)\s+([0-9a-fA-F]{8,16})\s+(\d+)\s+(\d+)\s+([0-9a-fA-F]{8,16})\s+([0-9a-fA-F]+)\s+(\d+|XXXX)\s+([0-9a-fA-F]{8,16})\s+(.+?)\s*$",
        )
        .unwrap()
    });
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim_end_matches('\r'))?;
            Some(SyncBlock {
                index: caps[1].parse().ok()?,
                syncblock: caps[2].to_lowercase(),
                monitor_held: caps[3].parse().ok()?,
                recursion: caps[4].parse().ok()?,
                owner_osid: caps[6].to_lowercase(),
                owner_dbg_id: caps[7].parse().ok(),
                object: caps[8].to_lowercase(),
                object_type: caps[9].to_string(),
            })
        })
        .collect()
}

fn parse_total(output: &str) -> Option<u64> {
    let re = TOTAL_RE.get_or_init(|| Regex::new(r"(?mi)^\s*Total:?\s+(\d+)").unwrap());
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadEntry;

    const SAMPLE: &str = "\
Index         SyncBlock MonitorHeld Recursion Owning Thread Info          SyncBlock Owner
   12 000001f2a3b4c5d6            5         1 000001f2a3b4d000 1b3c  14   000001f2a3b4e000 System.Object
   15 000001f2a3b4c600            1         2 000001f2a3b4d100 2c4d  16   000001f2a3b4e100 MyApp.Cache
-----------------------------
Total           20
CCW             0
RCW             0
";

    #[test]
    fn test_counts_waiters() {
        let ctx = AnalysisContext::new();
        let analysis = SyncBlkAnalyzer.analyze("!syncblk", SAMPLE, &ctx).unwrap();

        assert_eq!(analysis.summary, "2 monitor(s) held, 1 contended with waiting threads.");
        assert_eq!(
            analysis.findings[0],
            "Monitor on System.Object (0x000001f2a3b4e000) held by thread 14 (OSID 0x1b3c), 2 waiter(s), recursion 1"
        );
        assert!(analysis.findings.contains(&"Sync block table size: 20".to_string()));
    }

    #[test]
    fn test_owner_resolved_through_thread_table() {
        let ctx = AnalysisContext::new();
        ctx.threads().replace(vec![ThreadEntry {
            dbg_id: Some(14),
            managed_id: 9,
            osid: "1b3c".to_string(),
            lock_count: 1,
            apartment: "MTA".to_string(),
            exception: None,
            special: None,
        }]);

        let analysis = SyncBlkAnalyzer.analyze("!syncblk", SAMPLE, &ctx).unwrap();
        assert!(analysis.findings[0].contains("held by thread 14 (managed 9, OSID 0x1b3c)"));
    }

    #[test]
    fn test_empty_table() {
        let ctx = AnalysisContext::new();
        let output = "Index SyncBlock MonitorHeld Recursion Owning Thread Info  SyncBlock Owner\n-----------------------------\nTotal           4\n";
        let analysis = SyncBlkAnalyzer.analyze("!syncblk", output, &ctx).unwrap();
        assert_eq!(analysis.summary, "No monitors are currently held.");
    }

    #[test]
    fn test_unrecognized_output() {
        let ctx = AnalysisContext::new();
        assert!(SyncBlkAnalyzer.analyze("!syncblk", "No export syncblk found", &ctx).is_none());
    }
}
