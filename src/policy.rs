//! Filesystem and peer access policy.
//!
//! Every request passes a fixed validation pipeline before any file handle
//! is opened: peer allowlist, capability gates, filename syntax, lexical
//! containment under the served root, directory and extension allowlists,
//! overwrite protection. The first failing step wins.

use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::{FilesystemConfig, SecurityConfig};
use crate::{ErrorCode, MAX_FILENAME_LENGTH, TransferDirection};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("client address is not allowed")]
    PeerDenied,

    #[error("read operations are disabled")]
    ReadDisabled,

    #[error("write operations are disabled")]
    WriteDisabled,

    #[error("invalid filename")]
    InvalidFilename,

    #[error("path escapes the served root")]
    Traversal,

    #[error("directory is not allowed")]
    DirectoryDenied,

    #[error("file extension is not allowed")]
    ExtensionDenied,

    #[error("file already exists")]
    FileExists,

    #[error("file exceeds the configured size limit")]
    FileTooLarge,
}

impl PolicyViolation {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            PolicyViolation::FileExists => ErrorCode::FileAlreadyExists,
            PolicyViolation::FileTooLarge => ErrorCode::DiskFull,
            _ => ErrorCode::AccessViolation,
        }
    }
}

/// Frozen policy derived from the configuration at startup.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    root: PathBuf,
    allowed_directories: Vec<PathBuf>,
    read_enabled: bool,
    write_enabled: bool,
    max_file_size: u64,
    overwrite_protection: bool,
    allowed_clients: Vec<String>,
    allowed_extensions: Vec<String>,
}

impl AccessPolicy {
    pub fn new(filesystem: &FilesystemConfig, security: &SecurityConfig) -> Self {
        let allowed_directories = filesystem
            .allowed_directories
            .iter()
            .map(|dir| PathBuf::from(dir.trim_matches('/')))
            .collect();
        let allowed_extensions = security
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            root: filesystem.root_directory.clone(),
            allowed_directories,
            read_enabled: security.read_enabled,
            write_enabled: security.write_enabled,
            max_file_size: security.max_file_size,
            overwrite_protection: security.overwrite_protection,
            allowed_clients: security.allowed_clients.clone(),
            allowed_extensions,
        }
    }

    /// Exact address match, or `prefix/...` entries matched as a string
    /// prefix on the part before the slash. Not full CIDR arithmetic.
    pub fn peer_allowed(&self, peer: IpAddr) -> bool {
        if self.allowed_clients.is_empty() {
            return true;
        }
        let addr = peer.to_string();
        self.allowed_clients.iter().any(|entry| {
            if addr == *entry {
                return true;
            }
            match entry.split_once('/') {
                Some((prefix, _)) => !prefix.is_empty() && addr.starts_with(prefix),
                None => false,
            }
        })
    }

    /// Run the full pipeline for a request. On success, returns the
    /// root-contained absolute path the engine may open.
    pub fn authorize(
        &self,
        filename: &str,
        peer: IpAddr,
        direction: TransferDirection,
    ) -> Result<PathBuf, PolicyViolation> {
        if !self.peer_allowed(peer) {
            return Err(PolicyViolation::PeerDenied);
        }

        match direction {
            TransferDirection::Read if !self.read_enabled => {
                return Err(PolicyViolation::ReadDisabled);
            }
            TransferDirection::Write if !self.write_enabled => {
                return Err(PolicyViolation::WriteDisabled);
            }
            _ => {}
        }

        let relative = self.validate_filename(filename)?;
        let full_path = self.contain(&relative)?;

        self.check_directory(&relative)?;
        self.check_extension(&relative)?;

        if direction == TransferDirection::Write
            && self.overwrite_protection
            && full_path.exists()
        {
            debug!(filename, "overwrite protection rejected existing target");
            return Err(PolicyViolation::FileExists);
        }

        Ok(full_path)
    }

    /// Size ceiling; 0 means unlimited.
    pub fn check_size(&self, size: u64) -> Result<(), PolicyViolation> {
        if self.max_file_size > 0 && size > self.max_file_size {
            return Err(PolicyViolation::FileTooLarge);
        }
        Ok(())
    }

    /// Syntax checks on the raw request filename. Returns the normalized
    /// relative path (forward slashes, no empty or `.` segments).
    fn validate_filename(&self, filename: &str) -> Result<PathBuf, PolicyViolation> {
        if filename.is_empty() || filename.len() > MAX_FILENAME_LENGTH {
            return Err(PolicyViolation::InvalidFilename);
        }
        if filename.contains('\0') {
            return Err(PolicyViolation::InvalidFilename);
        }

        let normalized = filename.replace('\\', "/");
        if normalized.starts_with('/') {
            return Err(PolicyViolation::Traversal);
        }

        let mut relative = PathBuf::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(PolicyViolation::Traversal),
                other => relative.push(other),
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(PolicyViolation::InvalidFilename);
        }
        Ok(relative)
    }

    /// Join with the root and verify containment component-wise. The
    /// relative path is already free of `..`, so a lexical check suffices.
    fn contain(&self, relative: &Path) -> Result<PathBuf, PolicyViolation> {
        let full = self.root.join(relative);
        if full
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PolicyViolation::Traversal);
        }
        if !full.starts_with(&self.root) {
            return Err(PolicyViolation::Traversal);
        }
        Ok(full)
    }

    fn check_directory(&self, relative: &Path) -> Result<(), PolicyViolation> {
        if self.allowed_directories.is_empty() {
            return Ok(());
        }
        let dir = relative.parent().unwrap_or_else(|| Path::new(""));
        let allowed = self
            .allowed_directories
            .iter()
            .any(|entry| dir == entry || dir.starts_with(entry));
        if allowed {
            Ok(())
        } else {
            Err(PolicyViolation::DirectoryDenied)
        }
    }

    fn check_extension(&self, relative: &Path) -> Result<(), PolicyViolation> {
        if self.allowed_extensions.is_empty() {
            return Ok(());
        }
        let extension = relative
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if self.allowed_extensions.iter().any(|e| *e == extension) {
            Ok(())
        } else {
            Err(PolicyViolation::ExtensionDenied)
        }
    }
}
