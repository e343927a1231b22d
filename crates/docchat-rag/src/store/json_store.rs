use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::ChatStore;
use crate::types::{ChatDocument, ChatMessage, ChatThread};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    threads: Vec<ChatThread>,
    messages: Vec<ChatMessage>,
    documents: Vec<ChatDocument>,
}

/// Chat store kept in memory and, optionally, mirrored to a single JSON file.
///
/// Each mutation is applied to a copy that replaces the live data only after
/// the file write succeeded, so a failed write leaves no partial state behind.
pub struct JsonChatStore {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
}

impl JsonChatStore {
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            path: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let data = if path.exists() {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt chat store {}", path.display()))?
        } else {
            StoreData::default()
        };

        tracing::info!(
            path = %path.display(),
            threads = data.threads.len(),
            messages = data.messages.len(),
            "Opened chat store"
        );

        Ok(Self {
            data: Mutex::new(data),
            path: Some(path.to_path_buf()),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let mut guard = self.data.lock();
        let mut next = guard.clone();
        let out = apply(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn read<T>(&self, query: impl FnOnce(&StoreData) -> T) -> T {
        query(&self.data.lock())
    }
}

fn live_messages<'a>(
    data: &'a StoreData,
    thread_id: &'a str,
    user_id: &'a str,
) -> impl Iterator<Item = &'a ChatMessage> + 'a {
    data.messages
        .iter()
        .filter(move |m| m.thread_id == thread_id && m.user_id == user_id && !m.is_deleted)
}

#[async_trait]
impl ChatStore for JsonChatStore {
    async fn find_thread(&self, thread_id: &str) -> Result<Option<ChatThread>> {
        Ok(self.read(|d| d.threads.iter().find(|t| t.id == thread_id).cloned()))
    }

    async fn upsert_thread(&self, thread: ChatThread) -> Result<()> {
        self.mutate(|d| match d.threads.iter_mut().find(|t| t.id == thread.id) {
            Some(existing) => *existing = thread,
            None => d.threads.push(thread),
        })
    }

    async fn append_exchange(&self, user: ChatMessage, assistant: ChatMessage) -> Result<()> {
        self.mutate(|d| {
            d.messages.push(user);
            d.messages.push(assistant);
        })
    }

    async fn recent_messages(
        &self,
        thread_id: &str,
        user_id: &str,
        n: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = self.thread_messages(thread_id, user_id).await?;
        let skip = messages.len().saturating_sub(n);
        Ok(messages.split_off(skip))
    }

    async fn thread_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatMessage>> {
        // Insertion order breaks created_at ties
        let mut messages: Vec<ChatMessage> =
            self.read(|d| live_messages(d, thread_id, user_id).cloned().collect());
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn upsert_document(&self, document: ChatDocument) -> Result<()> {
        self.mutate(|d| match d.documents.iter_mut().find(|x| x.id == document.id) {
            Some(existing) => *existing = document,
            None => d.documents.push(document),
        })
    }

    async fn thread_documents(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatDocument>> {
        Ok(self.read(|d| {
            d.documents
                .iter()
                .filter(|x| x.thread_id == thread_id && x.user_id == user_id && !x.is_deleted)
                .cloned()
                .collect()
        }))
    }

    async fn user_threads(&self, user_id: &str) -> Result<Vec<ChatThread>> {
        let mut threads: Vec<ChatThread> = self.read(|d| {
            d.threads
                .iter()
                .filter(|t| t.user_id == user_id && !t.is_deleted)
                .cloned()
                .collect()
        });
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    async fn soft_delete_thread(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let owned = self.read(|d| {
            d.threads
                .iter()
                .any(|t| t.id == thread_id && t.user_id == user_id && !t.is_deleted)
        });
        if !owned {
            return Ok(false);
        }

        self.mutate(|d| {
            for thread in d.threads.iter_mut().filter(|t| t.id == thread_id) {
                thread.is_deleted = true;
            }
            for message in d.messages.iter_mut().filter(|m| m.thread_id == thread_id) {
                message.is_deleted = true;
            }
            for document in d.documents.iter_mut().filter(|x| x.thread_id == thread_id) {
                document.is_deleted = true;
            }
        })?;
        Ok(true)
    }
}
