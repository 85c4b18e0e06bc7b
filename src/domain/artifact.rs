//! Artifacts appended to a run's log.
//!
//! An artifact is immutable once appended. Its sequence index is assigned
//! by the log at append time and defines the total order of the run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Semantic tag of an artifact, used for trigger matching
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKind(String);

impl ArtifactKind {
    /// Kind stamped on the seed artifact
    pub const REQUEST: &'static str = "request";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The seed kind
    pub fn request() -> Self {
        Self::new(Self::REQUEST)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for ArtifactKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Who produced an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum Producer {
    /// The request that seeded the run
    ExternalRequest,

    /// A hired stage, by name
    Stage(String),
}

impl Producer {
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    /// True if this producer is the named stage
    pub fn is_stage(&self, name: &str) -> bool {
        matches!(self, Self::Stage(n) if n == name)
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExternalRequest => f.write_str("external-request"),
            Self::Stage(name) => f.write_str(name),
        }
    }
}

/// An artifact that has not been appended yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub producer: Producer,
    pub kind: ArtifactKind,
    pub content: String,
}

impl ArtifactDraft {
    pub fn new(producer: Producer, kind: impl Into<ArtifactKind>, content: impl Into<String>) -> Self {
        Self {
            producer,
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// Draft for the seed artifact of a run
    pub fn request(content: impl Into<String>) -> Self {
        Self::new(Producer::ExternalRequest, ArtifactKind::request(), content)
    }
}

/// An artifact stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Position in the log (dense, starting at 0)
    pub seq: u64,

    /// Stage (or external request) that produced this artifact
    pub producer: Producer,

    /// Semantic kind, used for subscription matching
    pub kind: ArtifactKind,

    /// Opaque payload
    pub content: String,

    /// When the artifact was appended
    pub created_at: DateTime<Utc>,

    /// Size in bytes (for tracking)
    pub size_bytes: u64,
}

impl Artifact {
    /// Stamp a draft with its sequence index
    pub(crate) fn from_draft(seq: u64, draft: ArtifactDraft) -> Self {
        let size_bytes = draft.content.len() as u64;
        Self {
            seq,
            producer: draft.producer,
            kind: draft.kind,
            content: draft.content,
            created_at: Utc::now(),
            size_bytes,
        }
    }
}
