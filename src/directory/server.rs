// Directory server: accepts register/lookup requests over TCP

use anyhow::Result;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use super::Directory;
use crate::config::DirectoryConfig;
use crate::wire::{self, DirectoryRequest, Location, WireError, INVALID_ACTION, REGISTER_ACK, USER_NOT_FOUND};

pub struct DirectoryServer {
    listener: TcpListener,
    directory: Directory,
    config: DirectoryConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Handle to a directory server running in the background
pub struct DirectoryServerHandle {
    addr: SocketAddr,
    directory: Directory,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DirectoryServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!("Directory accept loop ended abnormally: {}", e);
        }
    }
}

impl DirectoryServer {
    pub async fn bind(config: DirectoryConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Directory listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            directory: Directory::new(),
            config,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn directory(&self) -> Directory {
        self.directory.clone()
    }

    pub fn spawn(self) -> Result<DirectoryServerHandle> {
        let addr = self.local_addr()?;
        let directory = self.directory.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        Ok(DirectoryServerHandle {
            addr,
            directory,
            running,
            shutdown,
            task,
        })
    }

    /// Accept loop: one task per connection, bounded by `max_connections`
    pub async fn run(self) {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));

        while self.running.load(Ordering::SeqCst) {
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
                    debug!("Accepted directory connection from {}", peer);
                    let directory = self.directory.clone();
                    let limit = self.config.max_frame_bytes;
                    let idle = self.config.idle_timeout();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, directory, limit, idle).await {
                            warn!("Directory connection from {} failed: {}", peer, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept directory connection: {}", e);
                }
            }
        }
        info!("Directory accept loop stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    directory: Directory,
    limit: usize,
    idle: Duration,
) -> Result<(), WireError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        // A silent client must not hold its connection slot forever
        let read = match tokio::time::timeout(idle, wire::read_frame(&mut reader, limit)).await {
            Ok(read) => read,
            Err(_) => {
                debug!("Closing directory connection idle for {:?}", idle);
                break;
            }
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(WireError::FrameTooLarge { limit }) => {
                warn!("Dropping directory request larger than {} bytes", limit);
                wire::write_line(&mut write_half, INVALID_ACTION).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let reply = match wire::decode_json::<DirectoryRequest>(&frame) {
            Ok(request) => answer(&directory, request).await?,
            Err(e) => {
                warn!("Malformed directory request: {}", e);
                INVALID_ACTION.to_string()
            }
        };
        wire::write_line(&mut write_half, &reply).await?;
    }
    Ok(())
}

async fn answer(directory: &Directory, request: DirectoryRequest) -> Result<String, WireError> {
    match request {
        DirectoryRequest::Register { username, ip, port } => {
            directory.register(&username, &ip, port).await;
            info!("Registered {} at {}:{}", username, ip, port);
            Ok(REGISTER_ACK.to_string())
        }
        DirectoryRequest::Lookup { username } => match directory.lookup(&username).await {
            Some(entry) => {
                debug!("Lookup for {} resolved to {}", username, entry.address());
                Ok(serde_json::to_string(&Location {
                    ip: entry.ip,
                    port: entry.port,
                })?)
            }
            None => {
                debug!("Lookup for {} found nothing", username);
                Ok(USER_NOT_FOUND.to_string())
            }
        },
        DirectoryRequest::Unknown => Ok(INVALID_ACTION.to_string()),
    }
}
