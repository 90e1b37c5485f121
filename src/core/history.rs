//! History log: the append-only ledger of what the agent did.
//!
//! Entries are ordered by a sequence number assigned on append, never by
//! wall-clock time. The log is kept under a size budget by the memory
//! compactor, which replaces old entries with a single summary.

use serde::{Deserialize, Serialize};

/// Tag carried by entries supplied through `inject_memory`.
pub const INJECTED_TAG: &str = "injected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Plan,
    Step,
    Observation,
    Error,
    Metadata,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Plan => write!(f, "plan"),
            EntryKind::Step => write!(f, "step"),
            EntryKind::Observation => write!(f, "observation"),
            EntryKind::Error => write!(f, "error"),
            EntryKind::Metadata => write!(f, "metadata"),
        }
    }
}

/// One record in the history log.
///
/// Optional fields are omitted from the serialized form so the size estimate
/// tracks what the entry actually carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub seq: u64,
    pub kind: EntryKind,
    pub name: String,
    #[serde(default)]
    pub inputs_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Short free text, used by summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Number of original entries a summary stands for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<u64>,
}

impl HistoryEntry {
    pub fn new(kind: EntryKind, name: &str, inputs_digest: impl Into<String>) -> Self {
        Self {
            seq: 0,
            kind,
            name: name.to_string(),
            inputs_digest: inputs_digest.into(),
            result_digest: None,
            latency_ms: None,
            error: None,
            detail: None,
            tags: Vec::new(),
            compacted: None,
        }
    }

    pub fn with_result(mut self, digest: impl Into<String>) -> Self {
        self.result_digest = Some(digest.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        if !self.has_tag(tag) {
            self.tags.push(tag.to_string());
        }
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether this entry is a compaction summary.
    pub fn is_summary(&self) -> bool {
        self.compacted.is_some()
    }
}

/// Append-only, size-bounded ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    next_seq: u64,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted parts.
    ///
    /// `next_seq` never falls behind the entries it is given.
    pub fn from_parts(entries: Vec<HistoryEntry>, next_seq: u64) -> Self {
        let floor = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        Self {
            entries,
            next_seq: next_seq.max(floor),
        }
    }

    /// Append an entry, assigning the next sequence number. Returns it.
    pub fn append(&mut self, mut entry: HistoryEntry) -> u64 {
        let seq = self.next_seq;
        entry.seq = seq;
        self.next_seq += 1;
        tracing::trace!(seq, kind = %entry.kind, name = %entry.name, "History append");
        self.entries.push(entry);
        seq
    }

    /// Prepend externally supplied entries ahead of the native log.
    ///
    /// Injected entries keep their own sequence numbers and are tagged
    /// `injected`; native numbering continues after the largest of them.
    /// Returns the number of entries injected.
    pub fn inject(&mut self, entries: Vec<HistoryEntry>) -> usize {
        let count = entries.len();
        if count == 0 {
            return 0;
        }
        if let Some(max) = entries.iter().map(|e| e.seq).max() {
            self.next_seq = self.next_seq.max(max + 1);
        }
        let mut merged: Vec<HistoryEntry> = entries
            .into_iter()
            .map(|e| e.with_tag(INJECTED_TAG))
            .collect();
        merged.append(&mut self.entries);
        self.entries = merged;
        count
    }

    /// Replace every entry, as the compactor does. Sequence numbering is kept.
    pub fn replace_entries(&mut self, entries: Vec<HistoryEntry>) {
        self.entries = entries;
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Characters of the serialized entry list.
    pub fn size_estimate(&self) -> usize {
        estimate_size(&self.entries)
    }

    /// Rough token count, four characters per token.
    pub fn token_estimate(&self) -> usize {
        self.size_estimate() / 4
    }
}

/// Characters of a serialized entry list.
pub fn estimate_size(entries: &[HistoryEntry]) -> usize {
    serde_json::to_string(entries).map(|s| s.len()).unwrap_or(0)
}
