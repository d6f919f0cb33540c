// Rendezvous directory
// Maps a username to the address the participant last registered from

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::DirectoryEntry;

pub mod client;
pub mod server;

pub use client::{DirectoryClient, DirectoryError};
pub use server::{DirectoryServer, DirectoryServerHandle};

/// In-memory username registry shared by every directory connection.
///
/// Entries are never removed; a restart starts empty.
#[derive(Clone, Default)]
pub struct Directory {
    entries: Arc<RwLock<HashMap<String, DirectoryEntry>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `username`
    pub async fn register(&self, username: &str, ip: &str, port: u16) -> DirectoryEntry {
        let entry = DirectoryEntry::new(username, ip, port);
        let mut entries = self.entries.write().await;
        entries.insert(username.to_string(), entry.clone());
        entry
    }

    pub async fn lookup(&self, username: &str) -> Option<DirectoryEntry> {
        let entries = self.entries.read().await;
        entries.get(username).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
