//! Append-only, ordered artifact log.
//!
//! The log is owned by the scheduler and lent to stages by shared
//! reference, so appends are serialized by construction.

use crate::domain::{Artifact, ArtifactDraft};

/// Ordered sequence of artifacts for one run
#[derive(Debug, Clone, Default)]
pub struct ArtifactLog {
    artifacts: Vec<Artifact>,
}

impl ArtifactLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a draft and return its sequence index
    pub fn append(&mut self, draft: ArtifactDraft) -> u64 {
        let seq = self.artifacts.len() as u64;
        self.artifacts.push(Artifact::from_draft(seq, draft));
        seq
    }

    /// Artifacts matching a predicate, in log order
    pub fn slice<F>(&self, predicate: F) -> Vec<&Artifact>
    where
        F: Fn(&Artifact) -> bool,
    {
        self.artifacts.iter().filter(|a| predicate(a)).collect()
    }

    /// Artifacts appended at or after `since`
    pub fn since(&self, since: usize) -> &[Artifact] {
        self.artifacts.get(since..).unwrap_or(&[])
    }

    pub fn get(&self, seq: usize) -> Option<&Artifact> {
        self.artifacts.get(seq)
    }

    pub fn last(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// Index of the last appended artifact
    pub fn last_index(&self) -> Option<u64> {
        self.last().map(|a| a.seq)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    /// Hand the artifacts over to the run driver
    pub fn into_artifacts(self) -> Vec<Artifact> {
        self.artifacts
    }
}
