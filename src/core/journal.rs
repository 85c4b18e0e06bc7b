//! Append-only run journal with file-based persistence.
//!
//! Entries are stored as newline-delimited JSON (JSONL) under
//! `<home>/runs/<run_id>/journal.jsonl` for easy inspection. The journal
//! mirrors the in-memory artifact log; runs are never resumed from it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{EntryKind, JournalEntry};

const JOURNAL_FILE: &str = "journal.jsonl";

/// File-based journal for one run
#[derive(Debug, Clone)]
pub struct Journal {
    run_id: Uuid,

    /// Path to the journal.jsonl file
    path: PathBuf,
}

impl Journal {
    /// Create or open the journal of `run_id` under `runs_dir`
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            run_id,
            path: run_dir.join(JOURNAL_FILE),
        })
    }

    /// Open the journal of a recorded run without creating anything
    pub fn locate(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        if !run_dir.is_dir() {
            anyhow::bail!("Run {} not found in {}", run_id, runs_dir.display());
        }

        Ok(Self {
            run_id,
            path: run_dir.join(JOURNAL_FILE),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry
    pub async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;

        let json = serde_json::to_string(entry).context("Failed to serialize journal entry")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write journal entry")?;
        file.flush().await.context("Failed to flush journal entry")?;

        Ok(())
    }

    /// Read all entries in order
    pub async fn replay(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse journal entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Entries of one kind, in order
    pub async fn entries_of(&self, kind: EntryKind) -> Result<Vec<JournalEntry>> {
        let entries = self.replay().await?;
        Ok(entries.into_iter().filter(|e| e.kind == kind).collect())
    }

    /// Run IDs with a directory under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(uuid) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                    runs.push(uuid);
                }
            }
        }

        Ok(runs)
    }
}

/// Content digest recorded with appended artifacts (first 16 hex chars of SHA-256)
pub fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}
