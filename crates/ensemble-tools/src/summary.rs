// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-addressed summary store.
//!
//! Long tool outputs are summarized and stored as paired files under one
//! directory: `summary-<uuid>.txt` next to `original-<uuid>.txt`, with
//! `summary_hash_map.json` mapping SHA-256(original) → summary id so the
//! same document is never stored twice.  The map file is written with an
//! fsync; a corrupt map resets to empty with a warning.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

const HASH_MAP_FILE: &str = "summary_hash_map.json";

/// File-backed store of (original, summary) pairs.
pub struct SummaryStore {
    dir: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl SummaryStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating summary dir {}", dir.display()))?;
        let map = load_hash_map(&dir.join(HASH_MAP_FILE));
        Ok(Self {
            dir,
            map: Mutex::new(map),
        })
    }

    /// The default store location: `./summaries/`.
    pub fn default_dir() -> PathBuf {
        PathBuf::from("./summaries")
    }

    /// Store a document and its summary; returns the summary id.
    ///
    /// Content-addressed: storing the same document again returns the
    /// existing id without touching disk.
    pub fn store(&self, original: &str, summary: &str) -> anyhow::Result<String> {
        let hash = hex::encode(Sha256::digest(original.as_bytes()));
        if let Some(existing) = self.map.lock().get(&hash) {
            return Ok(existing.clone());
        }

        let id = Uuid::new_v4().to_string();
        fs::write(self.dir.join(format!("original-{id}.txt")), original)?;
        fs::write(self.dir.join(format!("summary-{id}.txt")), summary)?;

        let snapshot = {
            let mut map = self.map.lock();
            map.insert(hash, id.clone());
            map.clone()
        };
        self.persist_map(&snapshot)?;
        Ok(id)
    }

    /// Look up a stored document by content hash.
    pub fn id_for(&self, original: &str) -> Option<String> {
        let hash = hex::encode(Sha256::digest(original.as_bytes()));
        self.map.lock().get(&hash).cloned()
    }

    pub fn read_summary(&self, id: &str) -> anyhow::Result<String> {
        let path = self.dir.join(format!("summary-{id}.txt"));
        fs::read_to_string(&path).with_context(|| format!("no summary {id}"))
    }

    /// Read the stored original, optionally sliced to 1-based line bounds.
    pub fn read_source(
        &self,
        id: &str,
        line_start: Option<usize>,
        line_end: Option<usize>,
    ) -> anyhow::Result<String> {
        let path = self.dir.join(format!("original-{id}.txt"));
        let text =
            fs::read_to_string(&path).with_context(|| format!("no original for summary {id}"))?;
        match (line_start, line_end) {
            (None, None) => Ok(text),
            _ => {
                let start = line_start.unwrap_or(1).max(1);
                let lines: Vec<&str> = text.lines().collect();
                if start > lines.len() {
                    bail!("line_start {start} past end of document ({} lines)", lines.len());
                }
                let end = line_end.unwrap_or(lines.len()).min(lines.len());
                Ok(lines[start - 1..end].join("\n"))
            }
        }
    }

    /// Copy the stored original out to `file_path`.
    pub fn write_source(&self, id: &str, file_path: impl AsRef<Path>) -> anyhow::Result<()> {
        let text = self.read_source(id, None, None)?;
        fs::write(file_path.as_ref(), text)
            .with_context(|| format!("writing source {id} to {}", file_path.as_ref().display()))
    }

    fn persist_map(&self, snapshot: &HashMap<String, String>) -> anyhow::Result<()> {
        let path = self.dir.join(HASH_MAP_FILE);
        let json = serde_json::to_string_pretty(snapshot)?;
        let mut f = fs::File::create(&path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        Ok(())
    }
}

/// Load the hash map file, tolerating absence and corruption.
fn load_hash_map(path: &Path) -> HashMap<String, String> {
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt summary hash map; resetting to empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
