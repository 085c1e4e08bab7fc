use thiserror::Error;

use crate::ErrorCode;
use crate::policy::PolicyViolation;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("malformed packet: {0}")]
    Parse(String),

    #[error("illegal TFTP operation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("transfer timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    /// The wire error code a client sees when this error terminates its
    /// request. Timeouts and local I/O failures are code 0 per RFC 1350.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            TftpError::Parse(_) | TftpError::Protocol(_) => ErrorCode::IllegalOperation,
            TftpError::Policy(violation) => violation.wire_code(),
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorCode::FileNotFound
            }
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                ErrorCode::FileAlreadyExists
            }
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::AccessViolation
            }
            _ => ErrorCode::NotDefined,
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
