//! Artifacts: named outputs of succeeded steps.
//!
//! Artifacts are held by reference. The location is an opaque string (path,
//! URL or step reference); payloads themselves never live here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Url,
    #[default]
    Data,
    Reference,
}

impl ArtifactKind {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "file" => Some(ArtifactKind::File),
            "url" => Some(ArtifactKind::Url),
            "data" => Some(ArtifactKind::Data),
            "reference" => Some(ArtifactKind::Reference),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::File => write!(f, "file"),
            ArtifactKind::Url => write!(f, "url"),
            ArtifactKind::Data => write!(f, "data"),
            ArtifactKind::Reference => write!(f, "reference"),
        }
    }
}

/// A named output of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Logical creation order within the run.
    pub order: u64,
    /// Step that produced it.
    pub produced_by: String,
}

/// Artifacts of a run in creation order.
///
/// Registering a name twice keeps both records; lookups return the latest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactSet {
    items: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the output `name` of a succeeded step.
    ///
    /// The location comes from the result's `location` field when present,
    /// otherwise `step://<plan>/<step>/<name>`. A `kind` field in the result
    /// overrides the inferred kind.
    pub fn register_output(
        &mut self,
        name: &str,
        plan_id: &str,
        step: &str,
        result: &Value,
        content_hash: &str,
    ) -> &Artifact {
        let explicit = result.get("location").and_then(Value::as_str);
        let location = explicit
            .map(str::to_string)
            .unwrap_or_else(|| format!("step://{}/{}/{}", plan_id, step, name));
        let inferred = match explicit {
            Some(loc) if loc.starts_with("http://") || loc.starts_with("https://") => ArtifactKind::Url,
            Some(_) => ArtifactKind::File,
            None => ArtifactKind::Reference,
        };
        let kind = result
            .get("kind")
            .and_then(Value::as_str)
            .and_then(ArtifactKind::parse)
            .unwrap_or(inferred);

        self.push(Artifact {
            name: name.to_string(),
            kind,
            location,
            content_hash: Some(content_hash.to_string()),
            order: 0,
            produced_by: step.to_string(),
        })
    }

    /// Append an artifact, assigning the next creation order.
    pub fn push(&mut self, mut artifact: Artifact) -> &Artifact {
        artifact.order = self.items.len() as u64;
        tracing::debug!(name = %artifact.name, location = %artifact.location, "Artifact registered");
        self.items.push(artifact);
        &self.items[self.items.len() - 1]
    }

    /// Most recently registered artifact with this name.
    pub fn latest(&self, name: &str) -> Option<&Artifact> {
        self.items.iter().rev().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.latest(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
