//! Local conversation history.
//!
//! One JSON array of conversations at a fixed path, ordered
//! most-recently-touched first. A 30-day retention horizon is re-applied on
//! every load and every save, and a write that fails for lack of space
//! evicts the oldest conversation and retries until it fits or nothing is
//! left to evict.

use crate::config::config;
use crate::logging;
use crate::message::Message;
use crate::storage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Last-modified instant, persisted as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Whole-collection persistence. The store is the only writer; every
/// mutation is a replace-and-save of the full array.
pub trait HistoryBackend: Send + Sync {
    fn read(&self) -> Result<Option<String>, StoreError>;
    fn write(&self, payload: &str) -> Result<(), StoreError>;
}

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl HistoryBackend for FileBackend {
    fn read(&self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn write(&self, payload: &str) -> Result<(), StoreError> {
        storage::write_atomic(&self.path, payload.as_bytes()).map_err(|e| {
            if e.kind() == ErrorKind::StorageFull {
                StoreError::QuotaExceeded
            } else {
                StoreError::Io(e)
            }
        })
    }
}

pub struct ConversationStore {
    conversations: Vec<Conversation>,
    backend: Box<dyn HistoryBackend>,
    retention: Duration,
}

impl ConversationStore {
    /// Load persisted history, dropping conversations past the retention
    /// horizon. A corrupt history file is logged and treated as empty rather
    /// than taking the whole client down.
    pub fn load(backend: Box<dyn HistoryBackend>, retention_days: i64) -> Self {
        let conversations = match backend.read() {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(list) => list,
                Err(e) => {
                    logging::error(&format!("history file unreadable, starting empty: {}", e));
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                logging::error(&format!("history read failed, starting empty: {}", e));
                Vec::new()
            }
        };

        let mut store = Self {
            conversations,
            backend,
            retention: Duration::days(retention_days),
        };
        store.evict_expired();
        store
    }

    pub fn open_default() -> anyhow::Result<Self> {
        let path = storage::history_path()?;
        Ok(Self::load(
            Box::new(FileBackend::new(path)),
            config().history.retention_days,
        ))
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Display order: newest activity first. Independent of the persisted
    /// (most-recently-touched-first) order.
    pub fn sorted_for_display(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.iter().collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.timestamp));
        list
    }

    /// Drop every conversation older than the retention horizon. Idempotent.
    pub fn evict_expired(&mut self) -> usize {
        let horizon = Utc::now() - self.retention;
        let before = self.conversations.len();
        self.conversations.retain(|c| c.timestamp > horizon);
        before - self.conversations.len()
    }

    /// Create the conversation (default title, prepended) or replace its
    /// message snapshot and bump its timestamp, then move it to the front.
    /// Returns true when the conversation was newly created.
    pub fn upsert(&mut self, id: &str, messages: Vec<Message>) -> Result<bool, StoreError> {
        let created = match self.conversations.iter().position(|c| c.id == id) {
            Some(pos) => {
                let mut conv = self.conversations.remove(pos);
                conv.messages = messages;
                conv.timestamp = Utc::now();
                self.conversations.insert(0, conv);
                false
            }
            None => {
                self.conversations.insert(0, Conversation {
                    id: id.to_string(),
                    title: DEFAULT_TITLE.to_string(),
                    messages,
                    timestamp: Utc::now(),
                });
                true
            }
        };
        self.save()?;
        Ok(created)
    }

    pub fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        self.conversations.retain(|c| c.id != id);
        self.save()
    }

    /// Apply an asynchronously generated title, unless the user (or an
    /// earlier response) already renamed the conversation.
    pub fn set_title_if_default(&mut self, id: &str, title: &str) -> Result<bool, StoreError> {
        let Some(conv) = self.conversations.iter_mut().find(|c| c.id == id) else {
            return Ok(false);
        };
        if conv.title != DEFAULT_TITLE {
            return Ok(false);
        }
        conv.title = title.to_string();
        self.save()?;
        Ok(true)
    }

    /// Persist the collection. On quota exhaustion, evict the single oldest
    /// conversation and retry; the loop terminates because every retry
    /// shrinks the collection. An empty collection that still cannot be
    /// written is surfaced and abandoned — the in-memory state stays
    /// authoritative for the rest of the session.
    fn save(&mut self) -> Result<(), StoreError> {
        self.evict_expired();
        loop {
            let payload = serde_json::to_string(&self.conversations)?;
            match self.backend.write(&payload) {
                Ok(()) => return Ok(()),
                Err(StoreError::QuotaExceeded) => {
                    if self.conversations.is_empty() {
                        logging::error("history storage full and nothing left to evict");
                        return Err(StoreError::QuotaExceeded);
                    }
                    logging::warn("history storage full, evicting oldest conversation");
                    self.evict_oldest();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(pos) = self
            .conversations
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.timestamp)
            .map(|(pos, _)| pos)
        {
            self.conversations.remove(pos);
        }
    }

    /// Case-insensitive search over titles and message text.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let needle = query.to_lowercase();

        let mut hits = Vec::new();
        for conv in &self.conversations {
            let title_match = conv.title.to_lowercase().contains(&needle);

            let mut context = None;
            for msg in &conv.messages {
                let text = msg.content.text();
                if text.to_lowercase().contains(&needle) {
                    context = Some(match_context(&text, query));
                    break;
                }
            }

            if title_match || context.is_some() {
                hits.push(SearchHit {
                    id: conv.id.clone(),
                    title: conv.title.clone(),
                    context: context.unwrap_or_else(|| "Title match".to_string()),
                });
            }
        }
        hits
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub context: String,
}

/// Excerpt of the text surrounding the first match of `query`.
fn match_context(text: &str, query: &str) -> String {
    let lower_text = text.to_lowercase();
    let lower_query = query.to_lowercase();

    let Some(index) = lower_text.find(&lower_query) else {
        return format!("{}...", truncate_chars(text, 60));
    };

    let start = floor_boundary(text, index.saturating_sub(20));
    let end = floor_boundary(text, (index + query.len() + 40).min(text.len()));

    let mut context = text[start..end].to_string();
    if start > 0 {
        context = format!("...{}", context);
    }
    if end < text.len() {
        context = format!("{}...", context);
    }
    context
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn floor_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
