// Re-export needed modules for testing
pub mod config;
pub mod directory;
pub mod models;
pub mod peer;
pub mod store;
pub mod wire;

// Re-export main types for convenience
pub use models::*;
pub use directory::{Directory, DirectoryClient, DirectoryServer};
pub use peer::{Peer, PeerHandle};
pub use store::Store;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_entry_address() {
        let v4 = DirectoryEntry::new("alice", "10.0.0.5", 5000);
        assert_eq!(v4.address(), "10.0.0.5:5000");

        let v6 = DirectoryEntry::new("bob", "::1", 6000);
        assert_eq!(v6.address(), "[::1]:6000");
    }

    #[test]
    fn test_message_counterpart() {
        let msg = Message {
            id: "msg123".to_string(),
            sender: "bob".to_string(),
            receiver: "alice".to_string(),
            text: "hi".to_string(),
            delivered: false,
            timestamp: chrono::Utc::now(),
        };

        assert_eq!(msg.counterpart("bob"), "alice");
        assert_eq!(msg.counterpart("alice"), "bob");
        assert!(msg.is_pending());
    }

    #[test]
    fn test_contact_decision() {
        assert!(ContactDecision::Block.is_blocked());
        assert!(!ContactDecision::Accept.is_blocked());
    }
}
