use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};
use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, DEFAULT_WINDOW_SIZE,
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

/// Frozen configuration snapshot consumed by the server at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub filesystem: FilesystemConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on; `0.0.0.0` or `::` for all interfaces
    pub listen_address: IpAddr,
    pub listen_port: u16,
    /// Attempt an IPv6 bind first, falling back to IPv4
    pub ipv6_enabled: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 69,
            ipv6_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Root directory served to clients; must be absolute
    pub root_directory: PathBuf,
    /// Directory prefixes under the root clients may touch; empty = all
    pub allowed_directories: Vec<String>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/petrel/tftp"),
            allowed_directories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub read_enabled: bool,
    /// Disabled by default; TFTP writes are a large attack surface
    pub write_enabled: bool,
    /// Maximum file size in bytes; 0 = unlimited (not recommended)
    pub max_file_size: u64,
    /// Reject WRQ for an existing target per RFC 1350 error 6
    pub overwrite_protection: bool,
    /// Exact addresses or `prefix/...` entries; empty = all clients
    pub allowed_clients: Vec<String>,
    /// Lowercased, dot-stripped extensions; empty = all extensions
    pub allowed_extensions: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            read_enabled: true,
            write_enabled: false,
            max_file_size: 104_857_600, // 100 MB
            overwrite_protection: true,
            allowed_clients: Vec::new(),
            allowed_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Ceiling for RFC 2348 blksize negotiation; 512 without negotiation
    pub block_size: u16,
    /// Retransmission interval in seconds when the client negotiates none
    pub timeout_secs: u64,
    /// Ceiling for RFC 7440 windowsize negotiation; 1 = stop-and-wait
    pub window_size: u16,
    /// Per-block retransmissions before the transfer is abandoned
    pub max_retries: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE as u16,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            window_size: DEFAULT_WINDOW_SIZE as u16,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log destination; stdout when unset
    pub file: Option<PathBuf>,
    /// Emit structured audit events alongside regular logs
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for SIEM integration
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate a configuration for correctness. With `validate_bind`, also
/// probe that the listen address is available.
pub fn validate_config(config: &ServerConfig, validate_bind: bool) -> Result<()> {
    if !config.filesystem.root_directory.is_absolute() {
        return Err(TftpError::Config(
            "root_directory must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.filesystem.root_directory) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config(
                    "root_directory must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_directory does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.filesystem.root_directory) {
        return Err(TftpError::Config(format!(
            "root_directory is not readable: {}",
            e
        )));
    }

    if config.network.listen_port == 0 {
        return Err(TftpError::Config(
            "listen_port must be non-zero".to_string(),
        ));
    }

    let block_size = config.performance.block_size as usize;
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(TftpError::Config(format!(
            "block_size must be in range {}-{}",
            MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }

    if !(1..=255).contains(&config.performance.timeout_secs) {
        return Err(TftpError::Config(
            "timeout_secs must be in range 1-255".to_string(),
        ));
    }

    if config.performance.window_size == 0 {
        return Err(TftpError::Config(
            "window_size must be at least 1".to_string(),
        ));
    }

    if config.performance.max_retries == 0 {
        return Err(TftpError::Config(
            "max_retries must be at least 1".to_string(),
        ));
    }

    if config.security.write_enabled && !config.security.overwrite_protection {
        tracing::warn!("writes enabled without overwrite protection");
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    if validate_bind {
        let addr = std::net::SocketAddr::new(config.network.listen_address, config.network.listen_port);
        if let Err(e) = std::net::UdpSocket::bind(addr) {
            return Err(TftpError::Config(format!(
                "listen address is not available: {}",
                e
            )));
        }
    }

    Ok(())
}
