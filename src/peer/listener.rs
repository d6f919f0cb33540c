// Inbound message listener
// Accepts connections from other participants and stores the envelopes they carry

use anyhow::Result;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify, Semaphore};

use super::policy::ContactPolicy;
use crate::models::Message;
use crate::store::{Store, StoreError};
use crate::wire::{self, Envelope, WireError};

/// What happened to one inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Stored(Message),
    /// Sender is blocked; nothing was stored
    Blocked,
    /// Envelope claims to come from the owner; nothing was stored
    FromSelf,
}

/// Shared state used by every connection handler
#[derive(Clone)]
pub struct Inbox {
    store: Store,
    policy: Arc<dyn ContactPolicy>,
    // Serializes first-contact decisions so each new sender is asked about once
    first_contact: Arc<TokioMutex<()>>,
    msg_tx: mpsc::Sender<Message>,
    max_frame_bytes: usize,
    idle_timeout: Duration,
}

impl Inbox {
    pub fn new(
        store: Store,
        policy: Arc<dyn ContactPolicy>,
        msg_tx: mpsc::Sender<Message>,
        max_frame_bytes: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            first_contact: Arc::new(TokioMutex::new(())),
            msg_tx,
            max_frame_bytes,
            idle_timeout,
        }
    }

    /// Apply contact policy to one decoded envelope and store it if accepted
    pub async fn accept_envelope(&self, envelope: Envelope) -> Result<Inbound, StoreError> {
        let sender = envelope.sender_username;

        if sender == self.store.owner() {
            warn!("Discarding envelope that claims to come from {}", sender);
            return Ok(Inbound::FromSelf);
        }

        if self.store.is_blocked(&sender)? {
            debug!("Discarding message from blocked sender {}", sender);
            return Ok(Inbound::Blocked);
        }

        if !self.store.is_contact(&sender)? {
            let _gate = self.first_contact.lock().await;
            // Another handler may have decided while we waited
            let blocked = match self.store.contact(&sender)? {
                Some(contact) => contact.blocked,
                None => {
                    let decision = self.policy.decide(&sender).await;
                    match self.store.insert_contact(&sender, decision.is_blocked()) {
                        Ok(contact) => {
                            if contact.blocked {
                                info!("Blocked new contact {}", sender);
                            } else {
                                info!("Added {} to contacts", sender);
                            }
                            contact.blocked
                        }
                        Err(StoreError::ContactExists(_)) => {
                            info!("{} was added to contacts concurrently", sender);
                            self.store.is_blocked(&sender)?
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            if blocked {
                return Ok(Inbound::Blocked);
            }
        }

        let owner = self.store.owner().to_string();
        let message = self.store.insert_message(&sender, &owner, &envelope.message_text, true)?;
        if let Err(e) = self.msg_tx.try_send(message.clone()) {
            debug!("Inbound message {} not forwarded for display: {}", message.id, e);
        }
        Ok(Inbound::Stored(message))
    }

    /// Read envelopes until the peer closes. Bad frames are logged and skipped.
    pub async fn handle_connection(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        let mut reader = BufReader::new(stream);

        loop {
            let read = tokio::time::timeout(self.idle_timeout, wire::read_frame(&mut reader, self.max_frame_bytes));
            let frame = match read.await {
                Err(_) => {
                    debug!("Closing connection from {} after {:?} idle", peer, self.idle_timeout);
                    break;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break,
                Ok(Err(WireError::FrameTooLarge { limit })) => {
                    warn!("Skipping envelope from {} larger than {} bytes", peer, limit);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("Connection from {} failed: {}", peer, e);
                    break;
                }
            };

            let envelope = match wire::decode_json::<Envelope>(&frame) {
                Ok(envelope) if !envelope.sender_username.is_empty() => envelope,
                Ok(_) => {
                    warn!("Skipping envelope from {} without a sender", peer);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to decode message from {}: {}", peer, e);
                    continue;
                }
            };

            match self.accept_envelope(envelope).await {
                Ok(Inbound::Stored(message)) => {
                    info!("Received message {} from {}", message.id, message.sender);
                }
                Ok(Inbound::Blocked) | Ok(Inbound::FromSelf) => {}
                Err(e) => error!("Failed to store message from {}: {}", peer, e),
            }
        }
        debug!("Connection from {} closed", peer);
    }
}

pub struct Listener {
    listener: TcpListener,
    inbox: Inbox,
    max_connections: usize,
    listening: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, inbox: Inbox, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for messages on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            inbox,
            max_connections,
            listening: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag and wakeup used to stop the accept loop from outside
    pub fn stop_signal(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.listening.clone(), self.shutdown.clone())
    }

    /// Accept loop. Handlers already running finish even after stop.
    pub async fn run(self) {
        let permits = Arc::new(Semaphore::new(self.max_connections));

        while self.listening.load(Ordering::SeqCst) {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.notified() => break,
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.notified() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let inbox = self.inbox.clone();
                    tokio::spawn(async move {
                        inbox.handle_connection(stream).await;
                        drop(permit);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
        info!("Stopped listening for messages");
    }
}
