//! Term glossary for the chat backend.
//! Loads term pairs from JSON and returns only the entries whose source term
//! occurs in the current batch, so prompts stay short.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
}

/// On-disk glossary file format.
#[derive(Debug, Deserialize)]
struct GlossaryFile {
    version: u32,
    entries: Vec<GlossaryEntry>,
}

#[derive(Debug, Error)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct Glossary {
    version: u32,
    entries: Vec<GlossaryEntry>,
}

impl Glossary {
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, GlossaryError> {
        let file: GlossaryFile = serde_json::from_str(content)?;
        Ok(Self {
            version: file.version,
            entries: file.entries,
        })
    }

    /// Empty glossary (fallback when no file is configured or it fails to load).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose `source` appears in any of `texts` (case-insensitive).
    pub fn match_entries<S: AsRef<str>>(&self, texts: &[S]) -> Vec<GlossaryEntry> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let haystack: Vec<String> = texts.iter().map(|t| t.as_ref().to_lowercase()).collect();
        self.entries
            .iter()
            .filter(|e| {
                let needle = e.source.to_lowercase();
                haystack.iter().any(|t| t.contains(&needle))
            })
            .cloned()
            .collect()
    }
}
