// Message log: append-only apart from the delivered flag

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{Result, Store, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, sender, receiver, text, delivered, timestamp";

type RawMessage = (String, String, String, String, i32, String);

fn raw_message(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn into_message(raw: RawMessage) -> Result<Message> {
    let (id, sender, receiver, text, delivered, timestamp) = raw;
    Ok(Message {
        id,
        sender,
        receiver,
        text,
        delivered: delivered != 0,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
    })
}

impl Store {
    /// Record a sent or received message.
    ///
    /// Exactly one of `sender`/`receiver` must be the store owner.
    pub fn insert_message(&self, sender: &str, receiver: &str, text: &str, delivered: bool) -> Result<Message> {
        if (sender == self.owner) == (receiver == self.owner) {
            return Err(StoreError::ForeignMessage {
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                owner: self.owner.clone(),
            });
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: text.to_string(),
            delivered,
            timestamp: Utc::now(),
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (id, sender, receiver, text, delivered, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                message.id,
                message.sender,
                message.receiver,
                message.text,
                message.delivered as i32,
                message.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        debug!(
            "Stored message {} ({} -> {}, delivered={})",
            message.id, message.sender, message.receiver, message.delivered
        );
        Ok(message)
    }

    /// Flip a message to delivered. Returns `false` if it already was;
    /// there is no way back to pending.
    pub fn mark_delivered(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE messages SET delivered = 1 WHERE id = ? AND delivered = 0",
            params![id],
        )?;
        if changed > 0 {
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM messages WHERE id = ?", params![id], |row| row.get(0))
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::MessageNotFound(id.to_string())),
        }
    }

    pub fn message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS),
                params![id],
                raw_message,
            )
            .optional()?;
        raw.map(into_message).transpose()
    }

    /// Chat history with `counterpart`, oldest first
    pub fn conversation(&self, counterpart: &str) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages
                 WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
                 ORDER BY timestamp ASC, seq ASC",
                MESSAGE_COLUMNS
            ),
            params![self.owner, counterpart],
        )
    }

    /// Outbound messages still waiting for delivery, oldest first
    pub fn pending_outbound(&self) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages
                 WHERE delivered = 0 AND sender = ?
                 ORDER BY timestamp ASC, seq ASC",
                MESSAGE_COLUMNS
            ),
            params![self.owner],
        )
    }

    fn query_messages(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, raw_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(into_message(row?)?);
        }
        Ok(messages)
    }
}
