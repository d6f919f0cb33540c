// Store-and-forward delivery tests
// Direct delivery, pending storage for offline receivers and retry cycles

mod common;
use common::{closed_port, offline_peer, setup_logging, start_directory, start_peer, wait_for_message};

use anyhow::Result;
use log::info;

#[tokio::test]
async fn test_direct_delivery_recorded_on_both_sides() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let directory_addr = directory.local_addr().to_string();

    let mut alice = start_peer("alice", &directory_addr).await?;
    let bob = start_peer("bob", &directory_addr).await?;

    let location = bob.peer.directory().lookup("alice").await?.expect("alice registered on start");
    assert_eq!(location.port, alice.handle.local_addr().port());

    let sent = bob.peer.send_message("alice", "hi").await?;
    assert!(sent.delivered, "Reachable receiver should get the message immediately");
    assert_eq!((sent.sender.as_str(), sent.receiver.as_str()), ("bob", "alice"));

    let received = wait_for_message(&mut alice.inbound, 5).await.expect("alice should receive the message");
    assert_eq!(received.sender, "bob");
    assert_eq!(received.receiver, "alice");
    assert_eq!(received.text, "hi");
    assert!(received.delivered);

    // Both local logs hold the message
    let alice_history = alice.peer.history("bob")?;
    assert_eq!(alice_history.len(), 1);
    assert_eq!(alice_history[0].text, "hi");
    let bob_history = bob.peer.history("alice")?;
    assert_eq!(bob_history.len(), 1);
    assert!(bob_history[0].delivered);

    // First contact in each direction
    assert!(alice.peer.store().is_contact("bob")?);
    assert!(bob.peer.store().is_contact("alice")?);

    alice.handle.stop().await;
    bob.handle.stop().await;
    directory.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_receiver_gets_pending_message() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let bob = offline_peer("bob", &directory.local_addr().to_string())?;

    let sent = bob.peer.send_message("carol", "are you there?").await?;
    assert!(!sent.delivered);

    let pending = bob.peer.pending()?;
    assert_eq!(pending.len(), 1, "Exactly one pending message");
    assert_eq!(pending[0].id, sent.id);
    assert_eq!(pending[0].receiver, "carol");

    directory.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_delivers_after_receiver_registers() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let directory_addr = directory.local_addr().to_string();
    let bob = offline_peer("bob", &directory_addr)?;

    assert!(bob.peer.directory().lookup("carol").await?.is_none());
    let to_carol = bob.peer.send_message("carol", "see you soon").await?;
    let to_dave = bob.peer.send_message("dave", "still offline").await?;
    assert!(!to_carol.delivered && !to_dave.delivered);

    let worker = bob.peer.retry_worker();
    let report = worker.run_cycle().await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.unresolved, 2);

    info!("carol comes online");
    let mut carol = start_peer("carol", &directory_addr).await?;

    let report = worker.run_cycle().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.unresolved, 1, "dave is still unknown");

    let delivered = bob.peer.store().message(&to_carol.id)?.expect("message kept");
    assert!(delivered.delivered, "Pending message should flip to delivered");
    let untouched = bob.peer.store().message(&to_dave.id)?.expect("message kept");
    assert!(!untouched.delivered, "Unrelated pending message must stay pending");

    let received = wait_for_message(&mut carol.inbound, 5).await.expect("carol should receive the retry");
    assert_eq!(received.sender, "bob");
    assert_eq!(received.text, "see you soon");

    // A delivered message is never retried or reverted
    let report = worker.run_cycle().await;
    assert_eq!(report.attempted, 0);
    assert!(bob.peer.store().message(&to_carol.id)?.map(|m| m.delivered).unwrap_or(false));
    assert_eq!(bob.peer.history("carol")?.len(), 1, "Retry must not duplicate the message");

    carol.handle.stop().await;
    directory.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stale_location_keeps_message_pending() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let directory_addr = directory.local_addr().to_string();
    let bob = offline_peer("bob", &directory_addr)?;

    // Registered, but nobody is listening there any more
    let port = closed_port().await?;
    bob.peer.directory().register("ghost", "127.0.0.1", port).await?;

    let sent = bob.peer.send_message("ghost", "hello?").await?;
    assert!(!sent.delivered, "Failed attempt is recorded as pending");

    let report = bob.peer.retry_worker().run_cycle().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(bob.peer.pending()?.len(), 1);

    directory.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_directory_is_treated_as_offline() -> Result<()> {
    setup_logging();
    let port = closed_port().await?;
    let bob = offline_peer("bob", &format!("127.0.0.1:{}", port))?;

    let sent = bob.peer.send_message("alice", "queued").await?;
    assert!(!sent.delivered);

    let report = bob.peer.retry_worker().run_cycle().await;
    assert_eq!(report.unresolved, 1);
    assert_eq!(bob.peer.pending()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_sending_to_self_is_rejected() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let bob = offline_peer("bob", &directory.local_addr().to_string())?;

    assert!(bob.peer.start_chat("bob").is_err());
    assert!(bob.peer.send_message("bob", "echo").await.is_err());
    assert!(bob.peer.pending()?.is_empty());
    assert!(bob.peer.contacts()?.is_empty(), "Owner never becomes their own contact");

    directory.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_starting_chat_twice_keeps_one_contact() -> Result<()> {
    setup_logging();
    let directory = start_directory().await?;
    let bob = offline_peer("bob", &directory.local_addr().to_string())?;

    bob.peer.start_chat("alice")?;
    bob.peer.start_chat("alice")?;
    bob.peer.send_message("alice", "one").await?;

    let contacts = bob.peer.contacts()?;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].username, "alice");
    assert!(!contacts[0].blocked);

    directory.stop().await;
    Ok(())
}
