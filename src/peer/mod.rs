// src/peer/mod.rs
//! Per-participant messaging engine
//!
//! A `Peer` owns the participant's local store and ties together the inbound
//! listener, the one-shot sender used by the chat path and the background
//! retry worker that redelivers pending messages.

use anyhow::Result;
use log::{error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::PeerConfig;
use crate::directory::DirectoryClient;
use crate::models::{Contact, Message};
use crate::store::{Store, StoreError};

pub mod listener;
pub mod policy;
pub mod retry;
pub mod sender;

pub use listener::{Inbound, Inbox, Listener};
pub use policy::{AutoAccept, BlockList, ContactPolicy};
pub use retry::{Registration, RetryReport, RetryWorker};

/// Capacity of the inbound display channel
const INBOUND_CHANNEL_CAPACITY: usize = 100;

pub struct Peer {
    config: PeerConfig,
    store: Store,
    directory: DirectoryClient,
    policy: Arc<dyn ContactPolicy>,
}

/// Background tasks of a started participant
pub struct PeerHandle {
    addr: SocketAddr,
    listening: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    listener_task: JoinHandle<()>,
    retry_task: JoinHandle<()>,
}

impl PeerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and stop retrying. Handlers already
    /// running are left to finish.
    pub async fn stop(self) {
        self.listening.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        self.retry_task.abort();
        if let Err(e) = self.listener_task.await {
            error!("Listener ended abnormally: {}", e);
        }
    }
}

impl Peer {
    pub fn new(config: PeerConfig, store: Store, policy: Arc<dyn ContactPolicy>) -> Self {
        let directory = DirectoryClient::new(
            &config.directory_addr,
            config.directory_timeout(),
            config.max_frame_bytes,
        );
        Self {
            config,
            store,
            directory,
            policy,
        }
    }

    /// Open the participant's database and build the engine
    pub fn open(config: PeerConfig, policy: Arc<dyn ContactPolicy>) -> Result<Self> {
        config.validate()?;
        let path = config.resolve_db_path()?;
        let store = Store::open(&path, &config.username)?;
        info!("Using message store {}", path.display());
        Ok(Self::new(config, store, policy))
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    /// Bind the listener, register with the directory and spawn the
    /// listener and retry tasks. Inbound messages are also pushed to the
    /// returned channel for display.
    pub async fn start(&self) -> Result<(PeerHandle, mpsc::Receiver<Message>)> {
        let ip = self.config.listen_ip.clone().unwrap_or_else(discover_local_ip);
        let bind_ip: IpAddr = ip.parse()?;

        let (msg_tx, msg_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let inbox = Inbox::new(
            self.store.clone(),
            self.policy.clone(),
            msg_tx,
            self.config.max_frame_bytes,
            self.config.idle_timeout(),
        );
        let listener = Listener::bind(
            SocketAddr::new(bind_ip, self.config.listen_port),
            inbox,
            self.config.max_connections,
        )
        .await?;
        let addr = listener.local_addr()?;

        match self.directory.register(self.username(), &ip, addr.port()).await {
            Ok(()) => info!("Registered {} at {}:{}", self.username(), ip, addr.port()),
            Err(e) => warn!("Could not register with directory, will retry: {}", e),
        }

        let (listening, shutdown) = listener.stop_signal();
        let listener_task = tokio::spawn(listener.run());
        let retry_task = tokio::spawn(
            self.retry_worker()
                .with_registration(Registration { ip, port: addr.port() })
                .run(),
        );

        Ok((
            PeerHandle {
                addr,
                listening,
                shutdown,
                listener_task,
                retry_task,
            },
            msg_rx,
        ))
    }

    /// Retry worker bound to this participant's store and directory
    pub fn retry_worker(&self) -> RetryWorker {
        RetryWorker::new(
            self.store.clone(),
            self.directory.clone(),
            self.config.send_timeout(),
            self.config.retry_interval(),
        )
    }

    /// Remember `receiver` as an unblocked contact. Already knowing them is fine.
    pub fn start_chat(&self, receiver: &str) -> Result<(), StoreError> {
        self.reject_self(receiver)?;
        match self.store.insert_contact(receiver, false) {
            Ok(_) => {
                info!("Added {} to contacts", receiver);
                Ok(())
            }
            Err(StoreError::ContactExists(_)) => {
                info!("{} is already a contact", receiver);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve `receiver`, make one delivery attempt and record the outcome.
    ///
    /// An unresolvable or unreachable receiver is not an error: the message
    /// is stored pending and left to the retry worker.
    pub async fn send_message(&self, receiver: &str, text: &str) -> Result<Message, StoreError> {
        self.start_chat(receiver)?;

        let delivered = match self.directory.resolve(receiver).await {
            Some(location) => {
                match sender::send(&location, self.username(), text, self.config.send_timeout()).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Delivery to {} failed, keeping message pending: {}", receiver, e);
                        false
                    }
                }
            }
            None => {
                info!("{} is not reachable, message stored as pending", receiver);
                false
            }
        };

        self.store.insert_message(self.username(), receiver, text, delivered)
    }

    fn reject_self(&self, receiver: &str) -> Result<(), StoreError> {
        if receiver == self.username() {
            return Err(StoreError::ForeignMessage {
                sender: self.username().to_string(),
                receiver: receiver.to_string(),
                owner: self.username().to_string(),
            });
        }
        Ok(())
    }

    pub fn history(&self, counterpart: &str) -> Result<Vec<Message>, StoreError> {
        self.store.conversation(counterpart)
    }

    pub fn contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.store.contacts()
    }

    pub fn pending(&self) -> Result<Vec<Message>, StoreError> {
        self.store.pending_outbound()
    }
}

/// Address of the interface used for outbound traffic, or loopback
pub fn discover_local_ip() -> String {
    // Connecting a UDP socket sends nothing; it only selects a route
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("10.255.255.255:1")?;
        socket.local_addr()
    });
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip().to_string(),
        _ => "127.0.0.1".to_string(),
    }
}
