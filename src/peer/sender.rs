// One-shot direct delivery to another participant

use log::debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::models::DirectoryEntry;
use crate::wire::{self, Envelope, WireError};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not encode envelope: {0}")]
    Encode(#[from] WireError),
}

/// Connect to `location`, write one envelope, close.
///
/// The whole exchange is bounded by `timeout`. There is no retry here and no
/// application-level acknowledgement: success means the bytes were handed to
/// the peer's socket and the connection shut down cleanly.
pub async fn send(
    location: &DirectoryEntry,
    sender_username: &str,
    text: &str,
    timeout: Duration,
) -> Result<(), SendError> {
    let frame = wire::encode_json(&Envelope::new(sender_username, text))?;
    let addr = location.address();

    let attempt = async {
        let mut stream = TcpStream::connect(&addr).await?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => {
            debug!("Delivered envelope from {} to {} at {}", sender_username, location.username, addr);
            Ok(())
        }
        Ok(Err(e)) => Err(SendError::Io(e)),
        Err(_) => Err(SendError::Timeout(timeout)),
    }
}
