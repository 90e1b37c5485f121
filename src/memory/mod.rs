//! Memory management: keeping the history log inside its budget.

pub mod compactor;

pub use compactor::{
    compact, CompactionReport, ExtractiveSummarizer, MemoryCompactor, Summarizer, SUMMARY_NAME,
};
