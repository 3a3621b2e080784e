use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::quiz::loader::LoadTracker;
use crate::quiz::TestParameters;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Key-value storage that lives as long as one chat session does.
pub trait SessionStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: String, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All documents of a collection, in the order the store returns them.
    async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError>;
}

#[async_trait]
pub trait SpecialTestService: Send + Sync {
    /// `Ok(None)` means the service has no test under this id.
    async fn generate(&self, test_id: &str) -> Result<Option<TestParameters>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries().remove(key);
    }
}

/// Everything that belongs to one chat: its session storage and its load generation.
#[derive(Debug, Default)]
pub struct ChatSession {
    pub store: MemorySessionStore,
    pub loads: LoadTracker,
}

#[derive(Debug, Default)]
pub struct ChatSessions {
    sessions: Mutex<HashMap<i64, Arc<ChatSession>>>,
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, chat_id: i64) -> Arc<ChatSession> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        return sessions
            .entry(chat_id)
            .or_insert_with(|| Arc::new(ChatSession::default()))
            .clone();
    }
}
