// First-contact decision point
//
// The listener asks the policy exactly once per unknown sender; the answer is
// persisted as a contact before any message from that sender is stored.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::models::ContactDecision;

#[async_trait]
pub trait ContactPolicy: Send + Sync {
    async fn decide(&self, username: &str) -> ContactDecision;
}

/// Accept everyone
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAccept;

#[async_trait]
impl ContactPolicy for AutoAccept {
    async fn decide(&self, _username: &str) -> ContactDecision {
        ContactDecision::Accept
    }
}

/// Block a fixed set of usernames, accept the rest
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    blocked: HashSet<String>,
}

impl BlockList {
    pub fn new<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: usernames.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ContactPolicy for BlockList {
    async fn decide(&self, username: &str) -> ContactDecision {
        if self.blocked.contains(username) {
            ContactDecision::Block
        } else {
            ContactDecision::Accept
        }
    }
}
