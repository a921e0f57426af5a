//! Specialized analyzer trait and shared result types

use crate::context::AnalysisContext;
use serde::{Deserialize, Serialize};

/// Cost/quality class of an analyzer, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Deterministic parsing, no reasoning calls
    #[serde(rename = "tier1")]
    Parse,
    /// Light reasoning over a parsed digest
    #[serde(rename = "tier2")]
    LocalReasoning,
    /// Full chunked reasoning over raw output
    #[serde(rename = "tier3")]
    DeepReasoning,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Parse => "tier1",
            Tier::LocalReasoning => "tier2",
            Tier::DeepReasoning => "tier3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of a specialized analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub analyzer: String,
    pub tier: Tier,
    pub summary: String,
    pub findings: Vec<String>,
    /// Parsed tables, kept for callers that want more than the summary
    #[serde(default)]
    pub details: serde_json::Value,
}

/// A deterministic parser for one well-known command family
pub trait CommandAnalyzer: Send + Sync {
    /// Analyzer name (unique identifier)
    fn name(&self) -> &str;

    fn tier(&self) -> Tier {
        Tier::Parse
    }

    fn description(&self) -> &str {
        ""
    }

    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this analyzer understands the output of `command`
    fn can_analyze(&self, command: &str) -> bool;

    /// Parse `output`. `None` means the output did not have the expected shape
    /// and generic analysis should take over.
    fn analyze(&self, command: &str, output: &str, ctx: &AnalysisContext) -> Option<Analysis>;
}

/// Lowercase, trim, and fold the `!sos.` prefix so `!sos.threads` and `!threads` compare equal
pub fn normalize_command(command: &str) -> String {
    let cmd = command.trim().to_lowercase();
    match cmd.strip_prefix("!sos.") {
        Some(rest) => format!("!{}", rest),
        None => cmd,
    }
}

/// True when `command` is `verb` optionally followed by arguments
pub fn command_is(command: &str, verb: &str) -> bool {
    let cmd = normalize_command(command);
    match cmd.strip_prefix(verb) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAnalyzer;

    impl CommandAnalyzer for EchoAnalyzer {
        fn name(&self) -> &str {
            "echo"
        }

        fn can_analyze(&self, command: &str) -> bool {
            command_is(command, ".echo")
        }

        fn analyze(&self, _command: &str, output: &str, _ctx: &AnalysisContext) -> Option<Analysis> {
            Some(Analysis {
                analyzer: self.name().to_string(),
                tier: self.tier(),
                summary: output.to_string(),
                findings: Vec::new(),
                details: serde_json::Value::Null,
            })
        }
    }

    #[test]
    fn test_analyzer_defaults() {
        let analyzer = EchoAnalyzer;
        assert_eq!(analyzer.tier(), Tier::Parse);
        assert_eq!(analyzer.description(), "");
        assert!(analyzer.is_enabled());
    }

    #[test]
    fn test_tier_ordering_and_serde() {
        assert!(Tier::Parse < Tier::LocalReasoning);
        assert!(Tier::LocalReasoning < Tier::DeepReasoning);
        assert_eq!(serde_json::to_string(&Tier::Parse).unwrap(), "\"tier1\"");
        assert_eq!(Tier::DeepReasoning.to_string(), "tier3");
    }

    #[test]
    fn test_command_matching() {
        assert!(command_is("!threads", "!threads"));
        assert!(command_is("  !SOS.Threads -special", "!threads"));
        assert!(!command_is("!threadpool", "!threads"));
        assert!(!command_is("~*e !threads", "!threads"));
    }
}
