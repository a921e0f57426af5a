//! `!clrstack` parser: managed frames per thread, blocking call sites, in-flight exceptions

use crate::base::{command_is, Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static HEADER_RE: OnceLock<Regex> = OnceLock::new();
static FRAME_RE: OnceLock<Regex> = OnceLock::new();
static SOURCE_RE: OnceLock<Regex> = OnceLock::new();

/// Frames that park a thread; matched against the top of each stack
const BLOCKING_MARKERS: &[&str] = &[
    "monitor.enter",
    "monitor.reliableenter",
    "monitor.wait",
    "waithandle.wait",
    "waitone",
    "manualreseteventslim.wait",
    "semaphoreslim.wait",
    "task.wait",
    "getresult",
    "get_result",
    "spinwait",
    "thread.sleep",
    "thread.join",
    "readerwriterlock",
];

/// How many frames from the top decide whether a thread is blocked
const BLOCKING_DEPTH: usize = 3;
const MAX_PATTERNS: usize = 8;

#[derive(Debug, Clone, Serialize)]
struct Frame {
    child_sp: String,
    ip: String,
    call_site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct InFlightException {
    object: Option<String>,
    exception_type: String,
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct ThreadStack {
    osid: Option<String>,
    dbg_id: Option<u32>,
    frames: Vec<Frame>,
    exception: Option<InFlightException>,
}

impl ThreadStack {
    fn blocking_signature(&self) -> Option<String> {
        let top = &self.frames[..self.frames.len().min(BLOCKING_DEPTH)];
        let blocked = top.iter().any(|f| {
            let site = f.call_site.to_lowercase();
            BLOCKING_MARKERS.iter().any(|m| site.contains(m))
        });
        blocked.then(|| {
            top.iter()
                .map(|f| short_call_site(&f.call_site))
                .collect::<Vec<_>>()
                .join(" <- ")
        })
    }

    fn label(&self, ctx: &AnalysisContext) -> String {
        if let Some(osid) = &self.osid {
            let threads = ctx.threads();
            if let Some(entry) = threads.by_osid(osid) {
                return entry.label();
            }
            return match self.dbg_id {
                Some(dbg) => format!("thread {} (OSID 0x{})", dbg, osid),
                None => format!("OSID 0x{}", osid),
            };
        }
        "current thread".to_string()
    }
}

pub struct ClrStackAnalyzer;

impl CommandAnalyzer for ClrStackAnalyzer {
    fn name(&self) -> &str {
        "clrstack"
    }

    fn description(&self) -> &str {
        "Managed call stacks: blocking call sites grouped by pattern, exceptions"
    }

    fn can_analyze(&self, command: &str) -> bool {
        command_is(stack_command(command), "!clrstack")
    }

    fn analyze(&self, _command: &str, output: &str, ctx: &AnalysisContext) -> Option<Analysis> {
        let stacks = parse_stacks(output);
        if stacks.iter().all(|s| s.frames.is_empty() && s.exception.is_none()) {
            return None;
        }

        let mut patterns: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for stack in &stacks {
            if let Some(signature) = stack.blocking_signature() {
                patterns.entry(signature).or_default().push(stack.label(ctx));
            }
        }
        let blocked: usize = patterns.values().map(Vec::len).sum();
        let mut ranked: Vec<(&String, &Vec<String>)> = patterns.iter().collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let with_exception: Vec<&ThreadStack> = stacks.iter().filter(|s| s.exception.is_some()).collect();

        let summary = if let [only] = stacks.as_slice() {
            let mut text = format!("{} stack has {} frame(s).", capitalize(&only.label(ctx)), only.frames.len());
            if let Some(top) = only.frames.first() {
                text.push_str(&format!(" Top frame: {}.", short_call_site(&top.call_site)));
            }
            if only.blocking_signature().is_some() {
                text.push_str(" The thread is blocked.");
            }
            text
        } else {
            format!(
                "{} thread stack(s): {} blocked in {} distinct pattern(s), {} with an exception.",
                stacks.len(),
                blocked,
                patterns.len(),
                with_exception.len()
            )
        };

        let mut findings: Vec<String> = ranked
            .iter()
            .take(MAX_PATTERNS)
            .map(|(signature, threads)| {
                let sample: Vec<&str> = threads.iter().take(3).map(String::as_str).collect();
                format!(
                    "{} thread(s) blocked at {} (e.g. {})",
                    threads.len(),
                    signature,
                    sample.join(", ")
                )
            })
            .collect();
        for stack in &with_exception {
            if let Some(exception) = &stack.exception {
                let mut line = format!("{}: {}", stack.label(ctx), exception.exception_type);
                if let Some(message) = &exception.message {
                    line.push_str(&format!(": {}", message));
                }
                findings.push(line);
            }
        }
        if let [only] = stacks.as_slice() {
            findings.extend(
                only.frames
                    .iter()
                    .filter_map(|f| f.source.as_ref().map(|s| format!("{} at {}", short_call_site(&f.call_site), s)))
                    .take(3),
            );
        }

        let details = serde_json::json!({
            "threads": stacks,
            "blocked": blocked,
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

/// The `!clrstack` part of a thread-scoped command such as `~*e !clrstack` or `~~[1b3c]s; !clrstack -a`
fn stack_command(command: &str) -> &str {
    let last = command.rsplit(';').next().unwrap_or(command).trim();
    if last.starts_with('~') {
        return last
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim_start())
            .unwrap_or("");
    }
    last
}

fn parse_stacks(output: &str) -> Vec<ThreadStack> {
    let header = HEADER_RE
        .get_or_init(|| Regex::new(r"OS Thread Id:\s+0x([0-9a-fA-F]+)(?:\s+\((\d+)\))?").unwrap());
    let frame_re = FRAME_RE
        .get_or_init(|| Regex::new(r"^\s*([0-9a-fA-F]{8,16})\s+([0-9a-fA-F]{8,16})\s+(\S.*?)\s*$").unwrap());
    let source_re = SOURCE_RE.get_or_init(|| Regex::new(r"\s*\[([^\[\]]+ @ \d+)\]$").unwrap());

    let mut stacks = vec![ThreadStack::default()];
    for line in output.lines().map(|l| l.trim_end_matches('\r')) {
        if let Some(caps) = header.captures(line) {
            stacks.push(ThreadStack {
                osid: Some(caps[1].to_lowercase()),
                dbg_id: caps.get(2).and_then(|m| m.as_str().parse().ok()),
                ..ThreadStack::default()
            });
            continue;
        }
        let Some(current) = stacks.last_mut() else {
            continue;
        };

        if let Some(caps) = frame_re.captures(line) {
            let raw = &caps[3];
            let (call_site, source) = match source_re.captures(raw) {
                Some(src) => (raw[..src.get(0).map_or(raw.len(), |m| m.start())].to_string(), Some(src[1].to_string())),
                None => (raw.to_string(), None),
            };
            current.frames.push(Frame {
                child_sp: caps[1].to_lowercase(),
                ip: caps[2].to_lowercase(),
                call_site,
                source,
            });
            continue;
        }

        let trimmed = line.trim();
        if let Some(object) = trimmed.strip_prefix("Exception object:") {
            current.exception.get_or_insert_with(InFlightException::default).object = Some(object.trim().to_lowercase());
        } else if let Some(kind) = trimmed.strip_prefix("Exception type:") {
            current.exception.get_or_insert_with(InFlightException::default).exception_type = kind.trim().to_string();
        } else if let Some(message) = trimmed.strip_prefix("Message:") {
            let message = message.trim();
            if let Some(exception) = current.exception.as_mut() {
                if !message.is_empty() && message != "<none>" {
                    exception.message = Some(message.to_string());
                }
            }
        }
    }

    // leading section only survives when the output had no thread headers
    if stacks.len() > 1 && stacks[0].frames.is_empty() && stacks[0].exception.is_none() {
        stacks.remove(0);
    }
    for exception in stacks.iter_mut().filter_map(|s| s.exception.as_mut()) {
        if exception.exception_type.is_empty() {
            exception.exception_type = "unknown exception".to_string();
        }
    }
    stacks
}

/// `System.Threading.Monitor.Enter(System.Object)` -> `System.Threading.Monitor.Enter`
fn short_call_site(call_site: &str) -> &str {
    call_site.split('(').next().unwrap_or(call_site).trim()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
