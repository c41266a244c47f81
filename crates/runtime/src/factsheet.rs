//! FactSheet — bounded structured working memory extracted from tool
//! outputs and LLM reasoning, persisted per session.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fm_domain::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    FileContent,
    Architecture,
    Finding,
    Decision,
    Blocker,
    Correction,
    ToolResult,
    Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactEntry {
    pub id: String,
    pub category: FactCategory,
    pub fact: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub source: String,
    pub iteration: u32,
}

impl FactEntry {
    pub fn new(
        category: FactCategory,
        fact: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
        iteration: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            fact: fact.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            iteration,
        }
    }
}

/// Bounded by entry count and a rough token budget (chars / 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSheet {
    pub entries: Vec<FactEntry>,
    pub max_entries: usize,
    pub max_tokens: usize,
}

impl FactSheet {
    pub fn new(max_entries: usize, max_tokens: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            max_tokens,
        }
    }

    fn estimated_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.fact.len() / 4 + 8).sum()
    }

    /// Append a fact, evicting the oldest entries while over either
    /// bound.
    pub fn add(&mut self, entry: FactEntry) {
        self.entries.push(entry);
        while self.entries.len() > self.max_entries
            || (self.estimated_tokens() > self.max_tokens && self.entries.len() > 1)
        {
            self.entries.remove(0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the working-memory block injected into the system message.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Working Memory\n");
        for entry in &self.entries {
            let category = match entry.category {
                FactCategory::FileContent => "file",
                FactCategory::Architecture => "architecture",
                FactCategory::Finding => "finding",
                FactCategory::Decision => "decision",
                FactCategory::Blocker => "blocker",
                FactCategory::Correction => "correction",
                FactCategory::ToolResult => "tool",
                FactCategory::Environment => "env",
            };
            out.push_str(&format!(
                "- [{category}] {} (confidence {:.2})\n",
                entry.fact, entry.confidence
            ));
        }
        out
    }

    // ── Persistence (fact-sheet.json in the session directory) ─────

    pub fn persist(&self, session_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(session_dir).map_err(Error::Io)?;
        let path = session_dir.join("fact-sheet.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(Error::Io)?;
        Ok(())
    }

    pub fn load(session_dir: &Path) -> Result<Self> {
        let path = session_dir.join("fact-sheet.json");
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
