//! Memory lookup and write-back.
//!
//! Storage for [`FileMemoryStore`]: a JSON array of fact strings, oldest first,
//! at `~/.rusty_voice/memory.json` unless configured otherwise.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Given the latest user text, return at most `limit` relevant facts.
#[async_trait]
pub trait MemoryLookup: Send + Sync {
    async fn lookup(&self, query: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// Receives each completed exchange.
#[async_trait]
pub trait MemoryWriter: Send + Sync {
    async fn remember(&self, user_text: &str, assistant_text: &str) -> anyhow::Result<()>;
}

/// Memory disabled: lookups are empty, writes are dropped.
#[derive(Debug, Default)]
pub struct NoMemory;

#[async_trait]
impl MemoryLookup for NoMemory {
    async fn lookup(&self, _query: &str, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl MemoryWriter for NoMemory {
    async fn remember(&self, _user_text: &str, _assistant_text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct FileMemoryStore {
    path: PathBuf,
    max_entries: Option<usize>,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileMemoryStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: Option<usize>) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.filter(|&n| n > 0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a fact, evicting the oldest beyond `max_entries`.
    pub async fn add_fact(&self, fact: impl Into<String>) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut facts = self.load().await?;
        facts.push(fact.into());
        if let Some(max) = self.max_entries {
            let excess = facts.len().saturating_sub(max);
            facts.drain(..excess);
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&facts)?).await?;
        Ok(())
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Rank facts by shared words with `query`; newer facts win ties.
pub fn rank_facts(facts: &[String], query: &str, limit: usize) -> Vec<String> {
    let query_words = words(query);
    if query_words.is_empty() || limit == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, usize, &String)> = facts
        .iter()
        .enumerate()
        .filter_map(|(i, fact)| {
            let score = words(fact).intersection(&query_words).count();
            (score > 0).then_some((score, i, fact))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, _, fact)| fact.clone())
        .collect()
}

#[async_trait]
impl MemoryLookup for FileMemoryStore {
    async fn lookup(&self, query: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let facts = self.load().await?;
        let found = rank_facts(&facts, query, limit);
        debug!(stored = facts.len(), found = found.len(), "Memory lookup");
        Ok(found)
    }
}

#[async_trait]
impl MemoryWriter for FileMemoryStore {
    async fn remember(&self, user_text: &str, assistant_text: &str) -> anyhow::Result<()> {
        self.add_fact(format!(
            "User: {} / Assistant: {}",
            user_text.trim(),
            assistant_text.trim()
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_by_overlap_then_recency() {
        let facts = vec![
            "The user likes green tea".to_string(),
            "The user's dog is called Rex".to_string(),
            "The user drinks tea every morning".to_string(),
        ];
        let found = rank_facts(&facts, "What tea do I like?", 2);
        assert_eq!(found, vec![facts[0].clone(), facts[2].clone()]);

        let found = rank_facts(&facts, "tea", 1);
        assert_eq!(found, vec![facts[2].clone()]);
    }

    #[test]
    fn test_rank_no_overlap_is_empty() {
        let facts = vec!["The user likes green tea".to_string()];
        assert!(rank_facts(&facts, "What time is it?", 2).is_empty());
        assert!(rank_facts(&facts, "", 2).is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path().join("memory.json"), None);
        assert!(store.lookup("anything at all", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remember_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path().join("nested/memory.json"), Some(2));
        store.remember("my name is Ada", "Nice to meet you, Ada").await.unwrap();
        store.add_fact("Ada works on engines").await.unwrap();
        store.add_fact("Ada prefers tea").await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let facts: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(facts, vec!["Ada works on engines", "Ada prefers tea"]);

        let found = store.lookup("does ada like tea", 2).await.unwrap();
        assert_eq!(found[0], "Ada prefers tea");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, "{ not a list").unwrap();
        let store = FileMemoryStore::new(path, None);
        assert!(store.lookup("anything", 2).await.is_err());
    }
}
