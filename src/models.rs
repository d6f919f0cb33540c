use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a participant can currently be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub username: String,
    pub ip: String,
    pub port: u16,
}

impl DirectoryEntry {
    pub fn new(username: &str, ip: &str, port: u16) -> Self {
        DirectoryEntry {
            username: username.to_string(),
            ip: ip.to_string(),
            port,
        }
    }

    /// `ip:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub username: String,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub delivered: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// The participant on the other side of this message, seen from `owner`
    pub fn counterpart<'a>(&'a self, owner: &str) -> &'a str {
        if self.sender == owner {
            &self.receiver
        } else {
            &self.sender
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.delivered
    }
}

/// Outcome of the first-contact decision for an unknown sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactDecision {
    Accept,
    Block,
}

impl ContactDecision {
    pub fn is_blocked(self) -> bool {
        matches!(self, ContactDecision::Block)
    }
}
