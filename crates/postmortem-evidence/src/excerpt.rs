use crate::types::Summary;

const MAX_SUMMARY_CHARS: usize = 500;
const MAX_NOTABLE_LINES: usize = 5;
const NOTABLE_MARKERS: &[&str] = &[
    "exception",
    "error",
    "deadlock",
    "waiting",
    "blocked",
    "timeout",
    "failed",
    "unable to",
];

/// Deterministic summary from the leading lines of `output`, no reasoning involved
pub fn excerpt_summary(command: &str, output: &str) -> Summary {
    let meaningful: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if meaningful.is_empty() {
        return Summary {
            overall: format!("[{}] produced no output.", command),
            key_findings: Vec::new(),
        };
    }

    let mut overall = format!("[{}]", command);
    for line in &meaningful {
        if overall.len() + line.len() + 1 > MAX_SUMMARY_CHARS {
            overall.push_str(" ...");
            break;
        }
        overall.push(' ');
        overall.push_str(line);
    }
    if overall.len() > MAX_SUMMARY_CHARS + 4 {
        let mut cut = MAX_SUMMARY_CHARS;
        while !overall.is_char_boundary(cut) {
            cut -= 1;
        }
        overall.truncate(cut);
        overall.push_str("...");
    }

    let key_findings = meaningful
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            NOTABLE_MARKERS.iter().any(|m| lower.contains(m))
        })
        .take(MAX_NOTABLE_LINES)
        .map(|line| line.to_string())
        .collect();

    Summary {
        overall,
        key_findings,
    }
}
