// Public modules - shared between the daemon binary and the test suite
pub mod audit;
pub mod config;
pub mod error;
pub mod monitor;
pub mod netascii;
pub mod packet;
pub mod policy;
pub mod server;
pub mod transfer;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use monitor::Monitor;
pub use server::TftpServer;

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard for compatibility
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = 65468; // Max block size + 4 byte header
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_WINDOW_SIZE: usize = 1; // RFC 7440: windowsize=1 equals RFC 1350 behavior
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const MAX_FILENAME_LENGTH: usize = 512;

// TFTP Opcodes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, TftpError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::Parse(format!("invalid opcode: {}", value))),
        }
    }
}

// TFTP Error Codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Internal timeout and network failures are carried on the wire as
    /// code 0 with a descriptive message.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

// Transfer Mode (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// NETASCII mode - 8-bit ASCII with network line ending conversion (CR+LF)
    Netascii,
    /// OCTET mode - Binary transfer without conversion
    Octet,
    /// MAIL mode - Obsolete; translated like NETASCII
    Mail,
}

impl std::str::FromStr for TransferMode {
    type Err = TftpError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::Parse(format!("unknown transfer mode: {}", s))),
        }
    }
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }

    /// Whether line-ending translation applies to this mode.
    pub fn is_translated(&self) -> bool {
        matches!(self, TransferMode::Netascii | TransferMode::Mail)
    }
}

/// Which side of the transfer the server plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// RRQ - the server sends file data
    Read,
    /// WRQ - the server receives file data
    Write,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Read => "read",
            TransferDirection::Write => "write",
        }
    }
}
