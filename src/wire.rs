// Wire formats for the directory and peer protocols
//
// Every frame is one compact JSON document (or one literal reply line)
// terminated by '\n'. A trailing frame without a newline is accepted at EOF.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

pub const REGISTER_ACK: &str = "User registered successfully.";
pub const USER_NOT_FOUND: &str = "User not found.";
pub const INVALID_ACTION: &str = "Invalid action.";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// A request to the directory service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DirectoryRequest {
    Register { username: String, ip: String, port: u16 },
    Lookup { username: String },
    #[serde(other)]
    Unknown,
}

/// Body of a successful lookup reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub ip: String,
    pub port: u16,
}

/// A single chat message as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_username: String,
    pub message_text: String,
}

impl Envelope {
    pub fn new(sender: &str, text: &str) -> Self {
        Envelope {
            sender_username: sender.to_string(),
            message_text: text.to_string(),
        }
    }
}

/// Encode a value as one newline-terminated JSON frame
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_json<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    if !frame.ends_with(b"\n") {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, line.as_bytes()).await
}

/// Read the next frame, without its newline.
///
/// `Ok(None)` means the peer closed the connection. An oversized frame is
/// consumed up to its newline and reported as `FrameTooLarge`, leaving the
/// reader positioned at the start of the next frame.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let mut overflowed = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF
            if overflowed {
                return Err(WireError::FrameTooLarge { limit });
            }
            if frame.is_empty() {
                return Ok(None);
            }
            return Ok(Some(trim_frame(frame)));
        }

        let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };

        if !overflowed {
            if frame.len() + chunk.len() > limit {
                overflowed = true;
                frame.clear();
            } else {
                frame.extend_from_slice(chunk);
            }
        }
        reader.consume(consumed);

        if done {
            if overflowed {
                return Err(WireError::FrameTooLarge { limit });
            }
            return Ok(Some(trim_frame(frame)));
        }
    }
}

fn trim_frame(mut frame: Vec<u8>) -> Vec<u8> {
    if frame.ends_with(b"\r") {
        frame.pop();
    }
    frame
}

/// Read a single reply line and return it as text
pub async fn read_reply<R>(reader: &mut R, limit: usize) -> Result<String, WireError>
where
    R: AsyncBufRead + Unpin,
{
    match read_frame(reader, limit).await? {
        Some(frame) => Ok(String::from_utf8_lossy(&frame).trim().to_string()),
        None => Err(WireError::UnexpectedReply("connection closed before reply".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_directory_request_format() {
        let register: DirectoryRequest = serde_json::from_str(
            r#"{"action": "register", "username": "alice", "ip": "10.0.0.5", "port": 5000}"#,
        )
        .unwrap();
        assert_eq!(
            register,
            DirectoryRequest::Register {
                username: "alice".to_string(),
                ip: "10.0.0.5".to_string(),
                port: 5000
            }
        );

        let lookup = serde_json::to_value(DirectoryRequest::Lookup { username: "bob".to_string() }).unwrap();
        assert_eq!(lookup["action"], "lookup");
        assert_eq!(lookup["username"], "bob");

        let unknown: DirectoryRequest =
            serde_json::from_str(r#"{"action": "delete", "username": "bob"}"#).unwrap();
        assert_eq!(unknown, DirectoryRequest::Unknown);
    }

    #[test]
    fn test_envelope_field_names() {
        let frame = encode_json(&Envelope::new("bob", "hi\nthere")).unwrap();
        // Embedded newlines must be escaped so the frame stays on one line
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);

        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["sender_username"], "bob");
        assert_eq!(value["message_text"], "hi\nthere");
    }

    #[tokio::test]
    async fn test_read_frames_and_trailing_frame_at_eof() {
        let input: &[u8] = b"first\r\nsecond\nlast-without-newline";
        let mut reader = BufReader::new(input);

        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"second");
        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"last-without-newline");
        assert!(read_frame(&mut reader, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok\n");
        // Small internal buffer forces the frame to span several reads
        let mut reader = BufReader::with_capacity(8, input.as_slice());

        match read_frame(&mut reader, 16).await {
            Err(WireError::FrameTooLarge { limit }) => assert_eq!(limit, 16),
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
        assert_eq!(read_frame(&mut reader, 16).await.unwrap().unwrap(), b"ok");
    }
}
