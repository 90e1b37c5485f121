//! History compaction.
//!
//! When the history log grows past its budget, everything except the last
//! `keep_last` entries is folded into one `metadata` summary entry. The
//! summary text comes from a [`Summarizer`]; the default is extractive and
//! deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::core::history::{estimate_size, EntryKind, HistoryEntry, HistoryLog};
use crate::util::{digest, truncate};
use crate::{Error, Result};

/// Name of summary entries produced by compaction.
pub const SUMMARY_NAME: &str = "compacted_history";

const MAX_SUMMARY_STEPS: usize = 5;
const MAX_STEP_NAME: usize = 24;
const MAX_SUMMARY_ERRORS: usize = 3;
const MAX_ERROR_TEXT: usize = 48;

/// Turns a run of folded entries into summary text.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, head: &[HistoryEntry]) -> Result<String>;
}

/// Counts per kind, the first successful step names and the first errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, head: &[HistoryEntry]) -> Result<String> {
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut steps = Vec::new();
        let mut errors = Vec::new();

        for entry in head {
            if entry.is_summary() {
                continue;
            }
            *by_kind.entry(entry.kind.to_string()).or_default() += 1;
            if entry.kind == EntryKind::Step && entry.error.is_none() && steps.len() < MAX_SUMMARY_STEPS {
                steps.push(truncate(&entry.name, MAX_STEP_NAME));
            }
            if let Some(error) = &entry.error {
                if errors.len() < MAX_SUMMARY_ERRORS {
                    errors.push(truncate(&format!("{}: {}", entry.name, error), MAX_ERROR_TEXT));
                }
            }
        }

        let folded: u64 = head.iter().map(folded_count).sum();
        let counts: Vec<String> = by_kind.iter().map(|(k, n)| format!("{} {}", k, n)).collect();
        let mut parts = vec![format!("{} entries", folded)];
        if !counts.is_empty() {
            parts.push(counts.join(", "));
        }
        if !steps.is_empty() {
            parts.push(format!("steps: {}", steps.join(", ")));
        }
        if !errors.is_empty() {
            parts.push(format!("errors: {}", errors.join("; ")));
        }
        Ok(parts.join(" | "))
    }
}

fn folded_count(entry: &HistoryEntry) -> u64 {
    entry.compacted.unwrap_or(1)
}

/// What a compaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub entries_before: usize,
    pub entries_after: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    /// Original entries the new summary stands for.
    pub folded: u64,
}

/// Folds old history into a summary entry.
#[derive(Clone)]
pub struct MemoryCompactor {
    summarizer: Arc<dyn Summarizer>,
}

impl Default for MemoryCompactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCompactor").finish_non_exhaustive()
    }
}

impl MemoryCompactor {
    pub fn new() -> Self {
        Self {
            summarizer: Arc::new(ExtractiveSummarizer),
        }
    }

    pub fn with_summarizer(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Compact `history` to fit `budget` characters.
    ///
    /// Returns `None` when nothing changed: the log already fits, holds no
    /// more than `keep_last` entries, or everything before the tail is
    /// already a single summary. Applying it twice changes nothing the
    /// second time.
    ///
    /// # Errors
    /// Returns `Error::Persistence` if an entry has an empty name, or if the
    /// summarizer fails.
    pub fn compact(
        &self,
        history: &mut HistoryLog,
        keep_last: usize,
        budget: usize,
    ) -> Result<Option<CompactionReport>> {
        if let Some(bad) = history.entries().iter().find(|e| e.name.trim().is_empty()) {
            return Err(Error::Persistence(format!(
                "malformed history entry at seq {}: empty name",
                bad.seq
            )));
        }

        let chars_before = history.size_estimate();
        let entries_before = history.len();
        if chars_before <= budget || entries_before <= keep_last {
            return Ok(None);
        }

        let split = entries_before - keep_last;
        let (head, tail) = history.entries().split_at(split);
        if head.len() == 1 && head[0].is_summary() {
            return Ok(None);
        }

        let text = self
            .summarizer
            .summarize(head)
            .map_err(|e| Error::Persistence(format!("summarizer failed: {}", e)))?;
        let folded: u64 = head.iter().map(folded_count).sum();
        let summary = HistoryEntry::new(EntryKind::Metadata, SUMMARY_NAME, digest(head))
            .with_seq(head[0].seq)
            .with_detail(text)
            .with_tag("compacted");
        let summary = HistoryEntry {
            compacted: Some(folded),
            ..summary
        };

        let mut compacted = Vec::with_capacity(keep_last + 1);
        compacted.push(summary);
        compacted.extend_from_slice(tail);
        let chars_after = estimate_size(&compacted);
        history.replace_entries(compacted);

        tracing::info!(
            entries_before,
            entries_after = history.len(),
            chars_before,
            chars_after,
            "History compacted"
        );
        if chars_after > budget {
            tracing::warn!(chars_after, budget, "Compacted history still over budget");
        }

        Ok(Some(CompactionReport {
            entries_before,
            entries_after: history.len(),
            chars_before,
            chars_after,
            folded,
        }))
    }

    /// Compact when the log exceeds the configured thresholds.
    ///
    /// The trigger is `memory_budget_chars * safety_margin` (and the token
    /// budget scaled the same way, if set); that threshold is also the
    /// budget the log is compacted to.
    pub fn maybe_compact(
        &self,
        history: &mut HistoryLog,
        config: &AgentConfig,
    ) -> Result<Option<CompactionReport>> {
        if !Self::needs_compaction(history, config) {
            return Ok(None);
        }
        self.compact(history, config.keep_last, Self::budget(config))
    }

    /// Character budget derived from the configured thresholds.
    pub fn budget(config: &AgentConfig) -> usize {
        let budget = config.compaction_threshold_chars();
        match config.compaction_threshold_tokens() {
            Some(tokens) => budget.min(tokens.saturating_mul(4)),
            None => budget,
        }
    }

    pub fn needs_compaction(history: &HistoryLog, config: &AgentConfig) -> bool {
        history.size_estimate() > Self::budget(config)
    }
}

/// Compact with the extractive summarizer.
pub fn compact(
    history: &mut HistoryLog,
    keep_last: usize,
    budget: usize,
) -> Result<Option<CompactionReport>> {
    MemoryCompactor::new().compact(history, keep_last, budget)
}
