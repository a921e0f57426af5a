//! Tiered registry routing commands to specialized analyzers

use crate::base::{Analysis, CommandAnalyzer, Tier};
use crate::context::AnalysisContext;
use crate::{
    ClrStackAnalyzer, DumpHeapAnalyzer, FinalizeQueueAnalyzer, SyncBlkAnalyzer, ThreadPoolAnalyzer, ThreadsAnalyzer,
};

/// Listing entry for a registered analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerInfo {
    pub name: String,
    pub tier: Tier,
    pub description: String,
}

/// Registry for managing specialized analyzers, kept sorted cheapest tier first
pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn CommandAnalyzer>>,
}

impl AnalyzerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            analyzers: Vec::new(),
        }
    }

    /// Registry with the built-in parsers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ThreadsAnalyzer));
        registry.register(Box::new(DumpHeapAnalyzer));
        registry.register(Box::new(SyncBlkAnalyzer));
        registry.register(Box::new(ClrStackAnalyzer));
        registry.register(Box::new(ThreadPoolAnalyzer));
        registry.register(Box::new(FinalizeQueueAnalyzer));
        registry
    }

    /// Register an analyzer; disabled analyzers are dropped
    pub fn register(&mut self, analyzer: Box<dyn CommandAnalyzer>) {
        if !analyzer.is_enabled() {
            return;
        }
        self.analyzers.push(analyzer);
        // stable: registration order breaks ties within a tier
        self.analyzers.sort_by_key(|a| a.tier());
    }

    /// Cheapest analyzer able to handle `command`
    pub fn find(&self, command: &str) -> Option<&dyn CommandAnalyzer> {
        self.analyzers
            .iter()
            .find(|a| a.can_analyze(command))
            .map(|a| a.as_ref())
    }

    /// Run the first matching analyzer that recognizes the output shape
    pub fn analyze(&self, command: &str, output: &str, ctx: &AnalysisContext) -> Option<Analysis> {
        for analyzer in self.analyzers.iter().filter(|a| a.can_analyze(command)) {
            match analyzer.analyze(command, output, ctx) {
                Some(analysis) => return Some(analysis),
                None => tracing::debug!(
                    analyzer = analyzer.name(),
                    command,
                    "output not recognized, trying next analyzer"
                ),
            }
        }
        None
    }

    pub fn list(&self) -> Vec<AnalyzerInfo> {
        self.analyzers
            .iter()
            .map(|a| AnalyzerInfo {
                name: a.name().to_string(),
                tier: a.tier(),
                description: a.description().to_string(),
            })
            .collect()
    }

    /// Get number of registered analyzers
    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::command_is;

    struct TestAnalyzer {
        name: String,
        verb: String,
        tier: Tier,
        enabled: bool,
        recognizes: bool,
    }

    impl TestAnalyzer {
        fn boxed(name: &str, verb: &str, tier: Tier) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                verb: verb.to_string(),
                tier,
                enabled: true,
                recognizes: true,
            })
        }
    }

    impl CommandAnalyzer for TestAnalyzer {
        fn name(&self) -> &str {
            &self.name
        }

        fn tier(&self) -> Tier {
            self.tier
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn can_analyze(&self, command: &str) -> bool {
            command_is(command, &self.verb)
        }

        fn analyze(&self, _command: &str, _output: &str, _ctx: &AnalysisContext) -> Option<Analysis> {
            self.recognizes.then(|| Analysis {
                analyzer: self.name.clone(),
                tier: self.tier,
                summary: format!("from {}", self.name),
                findings: Vec::new(),
                details: serde_json::Value::Null,
            })
        }
    }

    #[test]
    fn test_registry_register() {
        let mut registry = AnalyzerRegistry::new();
        assert!(registry.is_empty());
        registry.register(TestAnalyzer::boxed("a", "!a", Tier::Parse));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disabled_analyzer_not_registered() {
        let mut registry = AnalyzerRegistry::new();
        let mut analyzer = TestAnalyzer::boxed("off", "!off", Tier::Parse);
        analyzer.enabled = false;
        registry.register(analyzer);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_find_prefers_cheapest_tier() {
        let mut registry = AnalyzerRegistry::new();
        registry.register(TestAnalyzer::boxed("deep", "!clrstack", Tier::DeepReasoning));
        registry.register(TestAnalyzer::boxed("light", "!clrstack", Tier::LocalReasoning));
        registry.register(TestAnalyzer::boxed("parse", "!clrstack", Tier::Parse));

        assert_eq!(registry.find("!clrstack -a").unwrap().name(), "parse");
        let names: Vec<_> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["parse", "light", "deep"]);
    }

    #[test]
    fn test_find_no_match() {
        let registry = AnalyzerRegistry::with_defaults();
        assert!(registry.find("!gcroot 0x1234").is_none());
        assert!(registry.find("!threads").is_some());
    }

    #[test]
    fn test_analyze_falls_through_unrecognized_output() {
        let mut registry = AnalyzerRegistry::new();
        let mut strict = TestAnalyzer::boxed("strict", "!eeheap", Tier::Parse);
        strict.recognizes = false;
        registry.register(strict);
        registry.register(TestAnalyzer::boxed("lenient", "!eeheap", Tier::LocalReasoning));

        let ctx = AnalysisContext::new();
        let analysis = registry.analyze("!eeheap -gc", "", &ctx).unwrap();
        assert_eq!(analysis.analyzer, "lenient");
    }
}
