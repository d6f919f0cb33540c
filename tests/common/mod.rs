// Common test utilities for integration tests
// Spins up a directory and participants on loopback with throwaway databases

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use log::LevelFilter;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley::config::{DirectoryConfig, PeerConfig};
use parley::directory::DirectoryServerHandle;
use parley::models::Message;
use parley::peer::{AutoAccept, ContactPolicy, Peer, PeerHandle};
use parley::DirectoryServer;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Start a directory on an ephemeral loopback port
pub async fn start_directory() -> Result<DirectoryServerHandle> {
    start_directory_with(DirectoryConfig::default()).await
}

/// Start a directory with custom limits; the bind address is always loopback
pub async fn start_directory_with(config: DirectoryConfig) -> Result<DirectoryServerHandle> {
    let config = DirectoryConfig {
        bind_addr: "127.0.0.1:0".parse()?,
        ..config
    };
    DirectoryServer::bind(config).await?.spawn()
}

/// A participant with its own temporary database
pub struct TestPeer {
    pub peer: Peer,
    _data_dir: TempDir,
}

/// A running participant: listener and retry worker are active
pub struct RunningPeer {
    pub peer: Peer,
    pub handle: PeerHandle,
    pub inbound: mpsc::Receiver<Message>,
    _data_dir: TempDir,
}

pub fn peer_config(username: &str, directory_addr: &str, data_dir: &TempDir) -> PeerConfig {
    let mut config = PeerConfig::new(username, directory_addr);
    config.listen_ip = Some("127.0.0.1".to_string());
    config.send_timeout_secs = 2;
    config.directory_timeout_secs = 2;
    // Tests drive retry cycles by hand
    config.retry_interval_secs = 3600;
    config.db_path = Some(data_dir.path().join(format!("{}.db", username)));
    config
}

/// Build a participant that is not listening
pub fn offline_peer(username: &str, directory_addr: &str) -> Result<TestPeer> {
    let data_dir = tempfile::tempdir()?;
    let config = peer_config(username, directory_addr, &data_dir);
    let peer = Peer::open(config, Arc::new(AutoAccept))?;
    Ok(TestPeer {
        peer,
        _data_dir: data_dir,
    })
}

pub async fn start_peer(username: &str, directory_addr: &str) -> Result<RunningPeer> {
    start_peer_with_policy(username, directory_addr, Arc::new(AutoAccept)).await
}

pub async fn start_peer_with_policy(
    username: &str,
    directory_addr: &str,
    policy: Arc<dyn ContactPolicy>,
) -> Result<RunningPeer> {
    start_peer_with(username, directory_addr, policy, |_| {}).await
}

/// Start a participant after letting the caller adjust its config
pub async fn start_peer_with(
    username: &str,
    directory_addr: &str,
    policy: Arc<dyn ContactPolicy>,
    adjust: impl FnOnce(&mut PeerConfig),
) -> Result<RunningPeer> {
    let data_dir = tempfile::tempdir()?;
    let mut config = peer_config(username, directory_addr, &data_dir);
    adjust(&mut config);
    let peer = Peer::open(config, policy)?;
    let (handle, inbound) = peer.start().await?;
    Ok(RunningPeer {
        peer,
        handle,
        inbound,
        _data_dir: data_dir,
    })
}

/// Wait for the next inbound message on a running participant
pub async fn wait_for_message(inbound: &mut mpsc::Receiver<Message>, secs: u64) -> Option<Message> {
    timeout(Duration::from_secs(secs), inbound.recv()).await.ok().flatten()
}

/// An address nothing is listening on
pub async fn closed_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
