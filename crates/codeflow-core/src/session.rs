//! In-memory session storage for pipeline runs.
//!
//! Each run gets its own [`Session`], addressed by application, user and
//! session id. The runner is handed the store explicitly; nothing is kept in
//! globals. Sessions live only as long as the process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// Key/value bag shared by the steps of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(BTreeMap<String, Value>);

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Text stored at `key`. Non-string values are not coerced.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: SessionState::new(),
            created_at: now,
            last_update_time: now,
        }
    }
}

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates an empty session. Fails if the key is already taken.
    async fn create(&self, key: SessionKey) -> Result<Session, PipelineError>;

    async fn get(&self, key: &SessionKey) -> Result<Session, PipelineError>;

    /// Writes one value, overwriting any previous value at `state_key`.
    async fn update_state(
        &self,
        key: &SessionKey,
        state_key: &str,
        value: Value,
    ) -> Result<(), PipelineError>;

    /// Removes a session; returns whether it existed.
    async fn delete(&self, key: &SessionKey) -> Result<bool, PipelineError>;

    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>, PipelineError>;

    /// Marks the session as in use by a run. Returns `false` when another
    /// run already holds it. Held sessions are never evicted.
    fn try_hold(&self, key: &SessionKey) -> bool;

    /// Ends a hold taken with [`SessionService::try_hold`].
    fn release(&self, key: &SessionKey);
}

#[derive(Debug, Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<SessionKey, Session>>,
    held: Mutex<HashSet<SessionKey>>,
    max_sessions: Option<usize>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max_sessions` sessions, evicting the oldest on create.
    pub fn with_capacity_limit(max_sessions: usize) -> Self {
        Self {
            max_sessions: Some(max_sessions.max(1)),
            ..Self::default()
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<SessionKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the oldest session no run is holding. Returns `false` when
    /// every session is held.
    fn evict_oldest(&self, sessions: &mut HashMap<SessionKey, Session>) -> bool {
        let held = self.held();
        let oldest = sessions
            .values()
            .filter(|s| !held.contains(&s.key))
            .min_by_key(|s| s.created_at)
            .map(|s| s.key.clone());
        match oldest {
            Some(key) => {
                log::debug!("Evicting session {}", key);
                sessions.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create(&self, key: SessionKey) -> Result<Session, PipelineError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(PipelineError::SessionAlreadyExists(key.to_string()));
        }
        if let Some(max) = self.max_sessions {
            while sessions.len() >= max {
                if !self.evict_oldest(&mut sessions) {
                    log::warn!(
                        "All {} sessions are held by running pipelines; exceeding the limit of {}",
                        sessions.len(),
                        max
                    );
                    break;
                }
            }
        }

        let session = Session::new(key.clone());
        sessions.insert(key, session.clone());
        log::debug!("Created session {}", session.key);
        Ok(session)
    }

    async fn get(&self, key: &SessionKey) -> Result<Session, PipelineError> {
        self.sessions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::SessionNotFound(key.to_string()))
    }

    async fn update_state(
        &self,
        key: &SessionKey,
        state_key: &str,
        value: Value,
    ) -> Result<(), PipelineError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| PipelineError::SessionNotFound(key.to_string()))?;
        session.state.set(state_key, value);
        session.last_update_time = Utc::now();
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, PipelineError> {
        Ok(self.sessions.write().await.remove(key).is_some())
    }

    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>, PipelineError> {
        let sessions = self.sessions.read().await;
        let mut keys: Vec<&Session> = sessions
            .values()
            .filter(|s| s.key.app_name == app_name && s.key.user_id == user_id)
            .collect();
        keys.sort_by_key(|s| s.created_at);
        Ok(keys.into_iter().map(|s| s.key.clone()).collect())
    }

    fn try_hold(&self, key: &SessionKey) -> bool {
        self.held().insert(key.clone())
    }

    fn release(&self, key: &SessionKey) {
        self.held().remove(key);
    }
}

/// Hands out `"{prefix}{n}"` session ids from a process-wide counter.
#[derive(Debug)]
pub struct SessionIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}
