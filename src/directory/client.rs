// Directory client: one request per connection

use log::{debug, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use crate::models::DirectoryEntry;
use crate::wire::{self, DirectoryRequest, Location, WireError, REGISTER_ACK, USER_NOT_FOUND};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory at {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Directory protocol error: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct DirectoryClient {
    addr: String,
    timeout: Duration,
    max_frame_bytes: usize,
}

impl DirectoryClient {
    pub fn new(addr: &str, timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            addr: addr.to_string(),
            timeout,
            max_frame_bytes,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Publish our current location under `username`
    pub async fn register(&self, username: &str, ip: &str, port: u16) -> Result<(), DirectoryError> {
        let reply = self
            .request(&DirectoryRequest::Register {
                username: username.to_string(),
                ip: ip.to_string(),
                port,
            })
            .await?;
        if reply != REGISTER_ACK {
            return Err(WireError::UnexpectedReply(reply).into());
        }
        debug!("Registered {} as {}:{} with directory {}", username, ip, port, self.addr);
        Ok(())
    }

    /// Resolve `username`. An unknown user is `Ok(None)`.
    pub async fn lookup(&self, username: &str) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let reply = self
            .request(&DirectoryRequest::Lookup {
                username: username.to_string(),
            })
            .await?;
        if reply == USER_NOT_FOUND {
            return Ok(None);
        }
        let location: Location = serde_json::from_str(&reply)
            .map_err(|_| WireError::UnexpectedReply(reply.clone()))?;
        Ok(Some(DirectoryEntry {
            username: username.to_string(),
            ip: location.ip,
            port: location.port,
        }))
    }

    /// Lookup that folds an unreachable directory into "not resolved"
    pub async fn resolve(&self, username: &str) -> Option<DirectoryEntry> {
        match self.lookup(username).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not resolve {}: {}", username, e);
                None
            }
        }
    }

    async fn request(&self, request: &DirectoryRequest) -> Result<String, DirectoryError> {
        let frame = wire::encode_json(request).map_err(DirectoryError::Wire)?;
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|source| DirectoryError::Unreachable {
                    addr: self.addr.clone(),
                    source,
                })?;
            let (read_half, mut write_half) = stream.into_split();
            wire::write_frame(&mut write_half, &frame).await?;
            let mut reader = BufReader::new(read_half);
            Ok::<_, DirectoryError>(wire::read_reply(&mut reader, self.max_frame_bytes).await?)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Timeout(self.timeout)),
        }
    }
}
