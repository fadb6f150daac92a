//! Session state and where it is persisted between client instances.
//!
//! # Design
//! The client keeps the live [`Session`] in memory and mirrors it into a
//! [`SessionStore`] under keys derived from the base URL, so two clients for
//! the same backend can share a login while clients for different backends
//! never see each other's sessions.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::resource::Resource;

/// An authenticated session: the backend's session id and the logged-in user.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user: Resource,
}

impl Session {
    pub fn user_guid(&self) -> Option<String> {
        self.user.guid()
    }
}

/// Key/value storage that outlives a single client.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// Process-local [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

pub(crate) fn user_key(base_url: &str) -> String {
    format!("{base_url}::user")
}

pub(crate) fn session_id_key(base_url: &str) -> String {
    format!("{base_url}::sessionID")
}
