//! Specialized deterministic analyzers for well-known debugger commands

pub mod base;
mod clrstack;
pub mod context;
mod dumpheap;
mod finalizequeue;
pub mod registry;
mod syncblk;
mod threadpool;
mod threads;

pub use base::{command_is, normalize_command, Analysis, CommandAnalyzer, Tier};
pub use clrstack::ClrStackAnalyzer;
pub use context::{AnalysisContext, ThreadEntry, ThreadTable};
pub use dumpheap::DumpHeapAnalyzer;
pub use finalizequeue::FinalizeQueueAnalyzer;
pub use registry::{AnalyzerInfo, AnalyzerRegistry};
pub use syncblk::SyncBlkAnalyzer;
pub use threadpool::ThreadPoolAnalyzer;
pub use threads::ThreadsAnalyzer;
