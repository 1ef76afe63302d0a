use super::repositories::{find_user_agent_id, insert_user_agent};
use crate::useragent::classify;
use rusqlite::Connection;
use std::collections::HashMap;

/// Raw user agent string to `user_agents.id`, filled lazily while a batch is
/// loaded. A cache must not outlive the transaction it was filled in: ids of
/// rows created in a rolled back transaction are meaningless.
#[derive(Debug, Default)]
pub struct UserAgentCache {
    ids: HashMap<String, i64>,
}

impl UserAgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, raw: &str) -> Option<i64> {
        self.ids.get(raw).copied()
    }

    /// Looks the agent up in the store, creating and classifying it when
    /// missing.
    pub fn resolve(&mut self, con: &Connection, raw: &str) -> rusqlite::Result<i64> {
        if let Some(id) = self.ids.get(raw) {
            return Ok(*id);
        }
        let id = match find_user_agent_id(con, raw)? {
            Some(id) => id,
            None => insert_user_agent(con, raw, &classify(Some(raw)))?,
        };
        self.ids.insert(raw.to_owned(), id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
