// src/store/mod.rs
//! Local persistence for one participant
//!
//! Contacts and messages live in a single SQLite database owned by the
//! participant. Every operation runs under one connection lock, so each
//! logical operation is atomic with respect to the others.

use log::debug;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub mod contacts;
pub mod messages;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Expected when the correspondent is already known
    #[error("{0} is already a contact")]
    ContactExists(String),

    #[error("No message with id {0}")]
    MessageNotFound(String),

    #[error("Message {sender} -> {receiver} does not involve {owner}")]
    ForeignMessage {
        sender: String,
        receiver: String,
        owner: String,
    },

    #[error("Invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("Store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Contact and message log for `owner`
#[derive(Clone)]
pub struct Store {
    owner: String,
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path, owner: &str) -> Result<Self> {
        debug!("Opening store for {} at {}", owner, path.display());
        let conn = Connection::open(path)?;
        Self::from_connection(conn, owner)
    }

    /// Volatile store, used by tests and throwaway participants
    pub fn open_in_memory(owner: &str) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, owner)
    }

    fn from_connection(conn: Connection, owner: &str) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::create_tables(&conn)?;
        Ok(Self {
            owner: owner.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS contacts (
                username TEXT PRIMARY KEY,
                blocked INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        // seq breaks ties between messages stored in the same microsecond
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                text TEXT NOT NULL,
                delivered INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS messages_pending ON messages (delivered, sender)",
            [],
        )?;

        Ok(())
    }

    /// The participant this store belongs to
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}
