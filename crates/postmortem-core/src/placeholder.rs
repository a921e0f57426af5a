//! Materializes `<...>` slots in command templates from prior evidence

use postmortem_evidence::{Evidence, EvidenceStore, StoreError};
use regex::Regex;
use std::cell::OnceCell;
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

static SLOT_RE: OnceLock<Regex> = OnceLock::new();
static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();
static THREAD_RE: OnceLock<Regex> = OnceLock::new();
static THREAD_ROW_RE: OnceLock<Regex> = OnceLock::new();
static NUMBER_RE: OnceLock<Regex> = OnceLock::new();

const ADDRESS_WORDS: &[&str] = &["address", "addr", "object", "obj", "mt", "methodtable", "handle", "ptr"];
const THREAD_WORDS: &[&str] = &["thread", "tid", "osid"];
const NUMERIC_WORDS: &[&str] = &["value", "count", "size", "index", "number"];
const FILLER_WORDS: &[&str] = &["of", "the", "a", "an", "id", "with", "for", "in", "on", "from", "one"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Address,
    Thread,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Largest,
    Smallest,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Full slot text including the angle brackets
    pub token: String,
    /// `None` when the slot names no known value kind
    pub kind: Option<PlaceholderKind>,
    pub hint: Option<Hint>,
    /// Type name that candidate lines must mention
    pub type_filter: Option<String>,
}

/// One slot and the value chosen for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderMatch {
    pub placeholder: String,
    pub value: String,
    /// Evidence the value was taken from
    pub evidence_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub template: String,
    pub command: String,
    pub matches: Vec<PlaceholderMatch>,
}

/// A template with at least one slot that could not be filled; it must not be run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved placeholders in `{template}`: {}", reasons.join("; "))]
pub struct Unresolved {
    pub template: String,
    pub reasons: Vec<String>,
}

/// Evidence text searched for slot values, most recent first
#[derive(Debug, Clone)]
pub struct EvidenceText {
    pub id: String,
    pub command: String,
    pub text: String,
}

impl EvidenceText {
    pub fn new(id: impl Into<String>, command: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            text: text.into(),
        }
    }
}

/// Records a resolver walks, index 0 being the most recent
pub trait EvidenceSource {
    fn record_count(&self) -> usize;

    /// Record at `index`; `None` when its text cannot be read
    fn record(&self, index: usize) -> Option<&EvidenceText>;
}

impl EvidenceSource for [EvidenceText] {
    fn record_count(&self) -> usize {
        self.len()
    }

    fn record(&self, index: usize) -> Option<&EvidenceText> {
        self.get(index)
    }
}

/// Store-backed records whose outputs are read only when a slot reaches them
pub struct StoredEvidence<'a> {
    store: &'a EvidenceStore,
    records: Vec<Evidence>,
    texts: Vec<OnceCell<Option<EvidenceText>>>,
}

impl<'a> StoredEvidence<'a> {
    /// Index rows of `store`, most recent first; no output is loaded yet
    pub fn load(store: &'a EvidenceStore) -> Result<Self, StoreError> {
        let records = store.list()?;
        let texts = records.iter().map(|_| OnceCell::new()).collect();
        Ok(Self { store, records, texts })
    }

    /// How many outputs have been read so far
    pub fn loaded(&self) -> usize {
        self.texts.iter().filter(|cell| cell.get().is_some()).count()
    }
}

impl EvidenceSource for StoredEvidence<'_> {
    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn record(&self, index: usize) -> Option<&EvidenceText> {
        let evidence = self.records.get(index)?;
        self.texts[index]
            .get_or_init(|| match self.store.load_output(evidence) {
                Ok(text) => Some(EvidenceText::new(evidence.id.as_str(), evidence.command.as_str(), text)),
                Err(e) => {
                    warn!(evidence = %evidence.id, error = %e, "evidence output unreadable, skipping for placeholders");
                    None
                }
            })
            .as_ref()
    }
}

fn slot_re() -> &'static Regex {
    SLOT_RE.get_or_init(|| Regex::new(r"<([^<>]+)>").unwrap())
}

pub fn has_placeholders(command: &str) -> bool {
    slot_re().is_match(command)
}

/// Slots of `template` in order of appearance
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    slot_re()
        .captures_iter(template)
        .map(|caps| parse_slot(&caps[0], &caps[1]))
        .collect()
}

fn parse_slot(token: &str, inner: &str) -> Placeholder {
    let words: Vec<String> = inner
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let lower: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let has_any = |vocab: &[&str]| lower.iter().any(|w| vocab.contains(&w.as_str()));

    let kind = if has_any(ADDRESS_WORDS) {
        Some(PlaceholderKind::Address)
    } else if has_any(THREAD_WORDS) {
        Some(PlaceholderKind::Thread)
    } else if has_any(NUMERIC_WORDS) {
        Some(PlaceholderKind::Numeric)
    } else {
        None
    };

    let hint = lower.iter().find_map(|w| match w.as_str() {
        "largest" | "biggest" | "most" | "large" => Some(Hint::Largest),
        "smallest" | "least" => Some(Hint::Smallest),
        "first" | "sample" | "any" => Some(Hint::First),
        "last" | "latest" => Some(Hint::Last),
        _ => None,
    });

    let type_filter = words
        .iter()
        .zip(&lower)
        .find(|(word, lower)| {
            word.len() >= 3
                && word.starts_with(|c: char| c.is_ascii_uppercase())
                && !is_vocabulary(lower)
        })
        .map(|(word, _)| word.trim_matches(|c: char| c == ',' || c == ';').to_string());

    Placeholder {
        token: token.to_string(),
        kind,
        hint,
        type_filter,
    }
}

fn is_vocabulary(word: &str) -> bool {
    ADDRESS_WORDS
        .iter()
        .chain(THREAD_WORDS)
        .chain(NUMERIC_WORDS)
        .chain(FILLER_WORDS)
        .chain(&[
            "largest", "biggest", "most", "large", "smallest", "least", "first", "sample", "any", "last",
            "latest",
        ])
        .any(|v| *v == word)
}

/// A value found in evidence text, with the line it sits on
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    value: String,
    /// Size or count annotation used for largest/smallest hints
    weight: Option<u64>,
}

/// Canonical address form: `0x` prefix, lowercase, debugger backtick removed
pub fn normalize_address(raw: &str) -> String {
    let digits = raw
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .replace('`', "");
    format!("0x{}", digits.to_lowercase())
}

fn extract(kind: PlaceholderKind, text: &str, type_filter: Option<&str>) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();

    for line in text.lines() {
        if let Some(type_name) = type_filter {
            if !line.contains(type_name) {
                continue;
            }
        }
        for (value, raw) in line_values(kind, line) {
            if seen.insert(value.clone()) {
                let weight = match kind {
                    PlaceholderKind::Numeric => value.parse().ok(),
                    _ => size_annotation(line, &raw),
                };
                candidates.push(Candidate { value, weight });
            }
        }
    }
    candidates
}

/// (normalized value, raw match) pairs on one line
fn line_values(kind: PlaceholderKind, line: &str) -> Vec<(String, String)> {
    match kind {
        PlaceholderKind::Address => {
            let re = ADDRESS_RE.get_or_init(|| {
                Regex::new(r"\b(?:0[xX])?(?:[0-9a-fA-F]{8}`[0-9a-fA-F]{8}|[0-9a-fA-F]{8,16})\b").unwrap()
            });
            re.find_iter(line)
                .map(|m| m.as_str())
                .filter(|raw| looks_like_address(raw) && !is_null_address(raw))
                .map(|raw| (normalize_address(raw), raw.to_string()))
                .collect()
        }
        PlaceholderKind::Thread => {
            // `!threads` rows open with DBG, ID, OSID and ThreadOBJ columns
            let row = THREAD_ROW_RE.get_or_init(|| {
                Regex::new(r"^\s*(\d+)\s+\d+\s+[0-9a-fA-F]+\s+[0-9a-fA-F]{8,16}\b").unwrap()
            });
            let re = THREAD_RE.get_or_init(|| {
                Regex::new(r"(?i)\b(?:thread|tid|osid)[:#\s]+(0x[0-9a-f]+|\d+)\b").unwrap()
            });
            row.captures(line)
                .into_iter()
                .chain(re.captures_iter(line))
                .map(|caps| {
                    let raw = caps[1].to_string();
                    (raw.to_lowercase(), raw)
                })
                .collect()
        }
        PlaceholderKind::Numeric => {
            let re = NUMBER_RE.get_or_init(|| Regex::new(r"\b\d+\b").unwrap());
            re.find_iter(line)
                .map(|m| (m.as_str().to_string(), m.as_str().to_string()))
                .collect()
        }
    }
}

/// Plain decimal counts and sizes also match the hex pattern; require a marker of hex-ness
fn looks_like_address(raw: &str) -> bool {
    raw.starts_with("0x")
        || raw.starts_with("0X")
        || raw.contains('`')
        || raw.starts_with("0000")
        || raw.chars().any(|c| matches!(c, 'a'..='f' | 'A'..='F'))
}

/// Null owner, lock and exception columns print as zero-filled addresses
fn is_null_address(raw: &str) -> bool {
    raw.trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .all(|c| c == '0' || c == '`')
}

/// Largest plain decimal on the line other than the candidate itself
fn size_annotation(line: &str, raw: &str) -> Option<u64> {
    let re = NUMBER_RE.get_or_init(|| Regex::new(r"\b\d+\b").unwrap());
    re.find_iter(line)
        .map(|m| m.as_str())
        .filter(|token| *token != raw && !(token.len() > 1 && token.starts_with('0')))
        .filter_map(|token| token.parse::<u64>().ok())
        .max()
}

fn select(candidates: &[Candidate], hint: Option<Hint>) -> Option<&Candidate> {
    match hint {
        None | Some(Hint::First) => candidates.first(),
        Some(Hint::Last) => candidates.last(),
        Some(Hint::Largest) => {
            let mut best: Option<&Candidate> = None;
            for candidate in candidates {
                let weight = candidate.weight.unwrap_or(0);
                if best.map_or(true, |b| weight > b.weight.unwrap_or(0)) {
                    best = Some(candidate);
                }
            }
            best
        }
        Some(Hint::Smallest) => {
            let mut best: Option<&Candidate> = None;
            for candidate in candidates.iter().filter(|c| c.weight.is_some()) {
                if best.map_or(true, |b| candidate.weight < b.weight) {
                    best = Some(candidate);
                }
            }
            best.or_else(|| candidates.first())
        }
    }
}

/// Fills slots from prior evidence; a template is resolved only when every slot is
#[derive(Debug, Clone, Default)]
pub struct PlaceholderResolver {
    exclude: HashSet<String>,
}

impl PlaceholderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values never chosen for any slot
    pub fn with_exclusions(exclude: impl IntoIterator<Item = String>) -> Self {
        Self {
            exclude: exclude.into_iter().collect(),
        }
    }

    /// Resolve `template` against `prior`, which must be ordered most recent first
    pub fn resolve(&self, template: &str, prior: &[EvidenceText]) -> Result<ResolvedCommand, Unresolved> {
        self.resolve_from(template, prior)
    }

    /// Resolve `template` against any record source, reading records only as far as a slot needs.
    ///
    /// Repeated slots of the same kind in one template get distinct values. On
    /// any unfilled slot the whole template is rejected with one reason per slot.
    pub fn resolve_from<S: EvidenceSource + ?Sized>(
        &self,
        template: &str,
        prior: &S,
    ) -> Result<ResolvedCommand, Unresolved> {
        let slots = placeholders(template);
        if slots.is_empty() {
            return Ok(ResolvedCommand {
                template: template.to_string(),
                command: template.to_string(),
                matches: Vec::new(),
            });
        }

        let mut used = self.exclude.clone();
        let mut matches = Vec::with_capacity(slots.len());
        let mut reasons = Vec::new();

        for slot in &slots {
            match self.resolve_slot(slot, prior, &used) {
                Ok(found) => {
                    used.insert(found.value.clone());
                    matches.push(found);
                }
                Err(reason) => reasons.push(reason),
            }
        }

        if !reasons.is_empty() {
            return Err(Unresolved {
                template: template.to_string(),
                reasons,
            });
        }

        let mut command = String::with_capacity(template.len());
        let mut last = 0;
        for (m, found) in slot_re().find_iter(template).zip(&matches) {
            command.push_str(&template[last..m.start()]);
            command.push_str(&found.value);
            last = m.end();
        }
        command.push_str(&template[last..]);

        Ok(ResolvedCommand {
            template: template.to_string(),
            command,
            matches,
        })
    }

    fn resolve_slot<S: EvidenceSource + ?Sized>(
        &self,
        slot: &Placeholder,
        prior: &S,
        used: &HashSet<String>,
    ) -> Result<PlaceholderMatch, String> {
        let Some(kind) = slot.kind else {
            return Err(format!("{} does not name an address, thread or numeric value", slot.token));
        };

        for evidence in (0..prior.record_count()).filter_map(|i| prior.record(i)) {
            let candidates: Vec<Candidate> = extract(kind, &evidence.text, slot.type_filter.as_deref())
                .into_iter()
                .filter(|c| !used.contains(&c.value))
                .collect();
            if let Some(chosen) = select(&candidates, slot.hint) {
                return Ok(PlaceholderMatch {
                    placeholder: slot.token.clone(),
                    value: chosen.value.clone(),
                    evidence_id: evidence.id.clone(),
                });
            }
        }

        let kind_name = match kind {
            PlaceholderKind::Address => "address",
            PlaceholderKind::Thread => "thread",
            PlaceholderKind::Numeric => "numeric",
        };
        let mut reason = format!("no {} value found for {}", kind_name, slot.token);
        if let Some(type_name) = &slot.type_filter {
            reason.push_str(&format!(" on lines mentioning {}", type_name));
        }
        reason.push_str(&format!(" in {} prior evidence records", prior.record_count()));
        Err(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMPHEAP: &str = "\
         Address               MT     Size
000001f2a3b40010 00007ff8a1230000      120
000001f2a3b40088 00007ff8a1230000      500
000001f2a3b40200 00007ff8a1239999       24
";

    fn prior(texts: &[&str]) -> Vec<EvidenceText> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| EvidenceText::new(format!("ev_{}", i), "!cmd", *text))
            .collect()
    }

    #[test]
    fn test_parse_slot() {
        let slots = placeholders("!gcroot <address_of_largest_System.String> <thread_id>");
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].kind, Some(PlaceholderKind::Address));
        assert_eq!(slots[0].hint, Some(Hint::Largest));
        assert_eq!(slots[0].type_filter.as_deref(), Some("System.String"));
        assert_eq!(slots[1].kind, Some(PlaceholderKind::Thread));
        assert_eq!(slots[1].type_filter, None);
    }

    #[test]
    fn test_largest_hint_uses_size_annotation() {
        let resolved = PlaceholderResolver::new()
            .resolve("!do <address of largest object>", &prior(&[DUMPHEAP]))
            .unwrap();
        assert_eq!(resolved.command, "!do 0x000001f2a3b40088");
        assert_eq!(resolved.matches[0].evidence_id, "ev_0");
    }

    #[test]
    fn test_first_and_smallest() {
        let resolver = PlaceholderResolver::new();
        let first = resolver.resolve("!do <sample_object>", &prior(&[DUMPHEAP])).unwrap();
        assert_eq!(first.command, "!do 0x000001f2a3b40010");
        let smallest = resolver
            .resolve("!do <smallest_object_address>", &prior(&[DUMPHEAP]))
            .unwrap();
        assert_eq!(smallest.command, "!do 0x000001f2a3b40200");
    }

    #[test]
    fn test_equal_weights_pick_earliest() {
        let text = "0000aaaa00000001 size 64\n0000aaaa00000002 size 64\n";
        let resolved = PlaceholderResolver::new()
            .resolve("!do <largest_obj>", &prior(&[text]))
            .unwrap();
        assert_eq!(resolved.command, "!do 0x0000aaaa00000001");
    }

    #[test]
    fn test_most_recent_evidence_wins() {
        let older = "object at 0000bbbb00000001";
        let newer = "object at 0000cccc00000001";
        let resolved = PlaceholderResolver::new()
            .resolve("!gcroot <object_address>", &prior(&[newer, older]))
            .unwrap();
        assert_eq!(resolved.command, "!gcroot 0x0000cccc00000001");
    }

    #[test]
    fn test_backtick_address_normalized() {
        let resolved = PlaceholderResolver::new()
            .resolve("!dumpmt <mt>", &prior(&["MethodTable: 00007ff8`A1230000"]))
            .unwrap();
        assert_eq!(resolved.command, "!dumpmt 0x00007ff8a1230000");
    }

    #[test]
    fn test_decimal_sizes_are_not_addresses() {
        let result = PlaceholderResolver::new().resolve("!do <address>", &prior(&["Total 104857600 bytes"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_type_filter_restricts_lines() {
        let text = "000001f2a3b40010 System.Byte[] 9000\n000001f2a3b40088 System.String 100\n";
        let resolved = PlaceholderResolver::new()
            .resolve("!do <largest System.String object>", &prior(&[text]))
            .unwrap();
        assert_eq!(resolved.command, "!do 0x000001f2a3b40088");
    }

    #[test]
    fn test_repeated_slots_get_distinct_values() {
        let resolved = PlaceholderResolver::new()
            .resolve("!objsize <object> ; !objsize <object>", &prior(&[DUMPHEAP]))
            .unwrap();
        assert_eq!(resolved.matches.len(), 2);
        assert_ne!(resolved.matches[0].value, resolved.matches[1].value);
    }

    #[test]
    fn test_thread_slot() {
        let resolved = PlaceholderResolver::new()
            .resolve("~<thread>s", &prior(&["Owning Thread: 6 holds the monitor"]))
            .unwrap();
        assert_eq!(resolved.command, "~6s");
    }

    #[test]
    fn test_unresolved_is_never_substituted() {
        let err = PlaceholderResolver::new()
            .resolve("!do <address> <thread_id>", &prior(&["000001f2a3b40010"]))
            .unwrap_err();
        assert_eq!(err.template, "!do <address> <thread_id>");
        assert_eq!(err.reasons.len(), 1);
        assert!(err.reasons[0].contains("<thread_id>"));
    }

    #[test]
    fn test_unknown_slot_kind_rejected() {
        let err = PlaceholderResolver::new()
            .resolve("!name2ee <module>", &prior(&["anything"]))
            .unwrap_err();
        assert!(err.reasons[0].contains("<module>"));
    }

    #[test]
    fn test_exclusions() {
        let resolver = PlaceholderResolver::with_exclusions(["0x000001f2a3b40088".to_string()]);
        let resolved = resolver.resolve("!do <largest object>", &prior(&[DUMPHEAP])).unwrap();
        assert_eq!(resolved.command, "!do 0x000001f2a3b40010");
    }

    #[test]
    fn test_null_addresses_are_skipped() {
        let syncblk = "   12 0000000000000000            0         0 0000000000000000     none    000001f2a3b4e000 System.Object\n";
        let resolved = PlaceholderResolver::new()
            .resolve("!do <sample_object>", &prior(&[syncblk]))
            .unwrap();
        assert_eq!(resolved.command, "!do 0x000001f2a3b4e000");

        let only_null = PlaceholderResolver::new().resolve("!do <address>", &prior(&["Exception: 00000000`00000000"]));
        assert!(only_null.is_err());
    }

    #[test]
    fn test_thread_slot_from_threads_table() {
        let threads = "\
 DBG   ID OSID ThreadOBJ           State GC Mode     GC Alloc Context                  Domain           Count Apt Exception
   0    1 4d8c 000001f2a3b4c5d6    2a020 Preemptive  0000000000000000:0000000000000000 000001f2a3b4d000 0     MTA
XXXX    5    0 000001f2a3b4d800    39820 Preemptive  0000000000000000:0000000000000000 000001f2a3b4d000 0     MTA
  14    9 1b3c 000001f2a3b4d000    2b220 Cooperative 0000000000000000:0000000000000000 000001f2a3b4d000 1     MTA
";
        let resolver = PlaceholderResolver::new();
        let first = resolver.resolve("~<thread>s", &prior(&[threads])).unwrap();
        assert_eq!(first.command, "~0s");
        let last = resolver.resolve("~<last_thread>s; !clrstack", &prior(&[threads])).unwrap();
        assert_eq!(last.command, "~14s; !clrstack");
    }

    #[test]
    fn test_stored_evidence_reads_lazily_and_skips_unreadable() {
        let temp = tempfile::tempdir().unwrap();
        let store = EvidenceStore::open_at(
            &temp.path().join("evidence.db"),
            temp.path().join("evidence"),
            "session_test",
            postmortem_evidence::StoreOptions {
                inline_threshold: 64,
                dedup_window: None,
            },
        )
        .unwrap();
        store.put("!dumpheap", &"000001f2a3b40010 size 64\n".repeat(10)).unwrap();
        store.put("!syncblk", "owner object 000001f2a3b4e000\n").unwrap();
        for entry in std::fs::read_dir(temp.path().join("evidence")).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        // newest record satisfies the slot, the external body is never read
        let prior = StoredEvidence::load(&store).unwrap();
        let resolved = PlaceholderResolver::new().resolve_from("!do <object>", &prior).unwrap();
        assert_eq!(resolved.command, "!do 0x000001f2a3b4e000");
        assert_eq!(prior.loaded(), 1);

        // a slot that needs the missing body fails cleanly instead of erroring
        let prior = StoredEvidence::load(&store).unwrap();
        let err = PlaceholderResolver::new()
            .resolve_from("!do <object> <address>", &prior)
            .unwrap_err();
        assert_eq!(err.reasons.len(), 1);
        assert_eq!(prior.loaded(), 2);
        assert!(prior.record(1).is_none());
    }

    #[test]
    fn test_template_without_slots_passes_through() {
        let resolved = PlaceholderResolver::new().resolve("!threads", &[]).unwrap();
        assert_eq!(resolved.command, "!threads");
        assert!(!has_placeholders(&resolved.command));
    }
}
