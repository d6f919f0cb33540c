// Configuration for the directory service and for participants
// Values come from defaults, then an optional JSON file, then environment
// variables; the binary applies command line flags last.

use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_DIRECTORY_PORT: u16 = 12345;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

static DATA_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Override the directory that holds per-user databases
pub fn set_data_dir_override(dir: PathBuf) {
    let _ = DATA_DIR_OVERRIDE.set(dir);
}

fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = DATA_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("Could not determine data directory"))?
        .join("parley");
    Ok(dir)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
    let parsed = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
    info!("Loaded configuration from {}", path.display());
    Ok(parsed)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    /// Connections silent for this long are closed
    pub idle_timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DIRECTORY_PORT)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl DirectoryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_parse("PARLEY_BIND_ADDR")? {
            self.bind_addr = addr;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be at least 1"));
        }
        if self.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be at least 1"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(anyhow!("idle_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub username: String,
    /// Address advertised to the directory; discovered when unset
    pub listen_ip: Option<String>,
    /// 0 picks an ephemeral port
    pub listen_port: u16,
    pub directory_addr: String,
    /// Defaults to `<data dir>/parley/<username>.db`
    pub db_path: Option<PathBuf>,
    pub send_timeout_secs: u64,
    pub directory_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    /// Inbound connections silent for this long are closed
    pub idle_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            username: String::new(),
            listen_ip: None,
            listen_port: 0,
            directory_addr: format!("127.0.0.1:{}", DEFAULT_DIRECTORY_PORT),
            db_path: None,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            directory_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl PeerConfig {
    pub fn new(username: &str, directory_addr: &str) -> Self {
        PeerConfig {
            username: username.to_string(),
            directory_addr: directory_addr.to_string(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(username) = std::env::var("PARLEY_USERNAME") {
            self.username = username;
        }
        if let Ok(addr) = std::env::var("PARLEY_DIRECTORY_ADDR") {
            self.directory_addr = addr;
        }
        if let Some(port) = env_parse("PARLEY_LISTEN_PORT")? {
            self.listen_port = port;
        }
        if let Ok(path) = std::env::var("PARLEY_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = env_parse("PARLEY_RETRY_INTERVAL_SECS")? {
            self.retry_interval_secs = secs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(anyhow!("username must not be empty"));
        }
        if self.retry_interval_secs == 0 {
            return Err(anyhow!("retry_interval_secs must be at least 1"));
        }
        if self.send_timeout_secs == 0 || self.directory_timeout_secs == 0 || self.idle_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be at least 1 second"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be at least 1"));
        }
        if self.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be at least 1"));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Resolve the database location, creating its parent directory
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        let path = match &self.db_path {
            Some(path) => path.clone(),
            None => data_dir()?.join(format!("{}.db", self.username)),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_peer_defaults() {
        let config = PeerConfig::new("alice", "127.0.0.1:12345");
        assert_eq!(config.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.listen_port, 0);
        assert!(config.validate().is_ok());

        let nameless = PeerConfig::default();
        assert!(nameless.validate().is_err(), "Empty username must be rejected");
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("peer.json");
        fs::write(&path, r#"{"username": "bob", "listen_port": 5001, "retry_interval_secs": 2}"#)?;

        let config = PeerConfig::load(&path)?;
        assert_eq!(config.username, "bob");
        assert_eq!(config.listen_port, 5001);
        assert_eq!(config.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.directory_addr, "127.0.0.1:12345");
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        Ok(())
    }

    #[test]
    fn test_explicit_db_path_parent_is_created() -> Result<()> {
        let dir = tempdir()?;
        let mut config = PeerConfig::new("carol", "127.0.0.1:12345");
        config.db_path = Some(dir.path().join("nested").join("carol.db"));

        let resolved = config.resolve_db_path()?;
        assert!(resolved.parent().unwrap().exists());
        Ok(())
    }

    #[test]
    fn test_directory_config_rejects_zero_limits() {
        let mut config = DirectoryConfig::default();
        assert!(config.validate().is_ok());
        config.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = DirectoryConfig::default();
        config.idle_timeout_secs = 0;
        assert!(config.validate().is_err(), "Idle connections must eventually be closed");
    }
}
