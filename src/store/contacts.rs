// Contact list with accept/block policy

use rusqlite::{params, OptionalExtension};

use super::{Result, Store, StoreError};
use crate::models::Contact;

impl Store {
    /// Add a contact. Fails with `ContactExists` (and leaves the existing
    /// record untouched) when the username is already known.
    pub fn insert_contact(&self, username: &str, blocked: bool) -> Result<Contact> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO contacts (username, blocked) VALUES (?, ?)",
            params![username, blocked as i32],
        )?;
        if inserted == 0 {
            return Err(StoreError::ContactExists(username.to_string()));
        }
        Ok(Contact {
            username: username.to_string(),
            blocked,
        })
    }

    pub fn contact(&self, username: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        let contact = conn
            .query_row(
                "SELECT username, blocked FROM contacts WHERE username = ?",
                params![username],
                |row| {
                    Ok(Contact {
                        username: row.get(0)?,
                        blocked: row.get::<_, i32>(1)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(contact)
    }

    pub fn is_contact(&self, username: &str) -> Result<bool> {
        Ok(self.contact(username)?.is_some())
    }

    /// Unknown usernames are not blocked
    pub fn is_blocked(&self, username: &str) -> Result<bool> {
        Ok(self.contact(username)?.map(|c| c.blocked).unwrap_or(false))
    }

    pub fn contacts(&self) -> Result<Vec<Contact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT username, blocked FROM contacts ORDER BY username")?;
        let rows = stmt.query_map([], |row| {
            Ok(Contact {
                username: row.get(0)?,
                blocked: row.get::<_, i32>(1)? != 0,
            })
        })?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_contact_keeps_original_flag() -> Result<()> {
        let store = Store::open_in_memory("alice")?;
        store.insert_contact("mallory", true)?;

        match store.insert_contact("mallory", false) {
            Err(StoreError::ContactExists(name)) => assert_eq!(name, "mallory"),
            other => panic!("Expected ContactExists, got {:?}", other),
        }

        let contacts = store.contacts()?;
        assert_eq!(contacts.len(), 1, "Duplicate insert must not add a record");
        assert!(contacts[0].blocked, "Duplicate insert must not change the blocked flag");
        Ok(())
    }

    #[test]
    fn test_blocked_lookup() -> Result<()> {
        let store = Store::open_in_memory("alice")?;
        store.insert_contact("bob", false)?;
        store.insert_contact("eve", true)?;

        assert!(!store.is_blocked("bob")?);
        assert!(store.is_blocked("eve")?);
        assert!(!store.is_blocked("stranger")?);
        assert!(store.is_contact("bob")?);
        assert!(!store.is_contact("stranger")?);
        Ok(())
    }
}
