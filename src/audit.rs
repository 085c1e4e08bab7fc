use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{Level, event};

/// Security audit event types for SIEM integration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Server startup event
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    /// Server shutdown event
    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// File read request received
    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// Write request received
    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// Request denied by policy
    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        reason: String,
    },

    /// File transfer started
    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        file_size: u64,
        mode: String,
        block_size: usize,
        window_size: usize,
    },

    /// File transfer completed successfully
    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        bytes_transferred: u64,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    /// File transfer failed
    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        error: String,
        bytes_transferred: u64,
    },

    /// Path traversal attempt detected
    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    /// File size limit exceeded
    FileSizeLimitExceeded {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        file_size: u64,
        max_allowed: u64,
    },

    /// Invalid protocol operation
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

/// Common fields present in all audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Hostname or system identifier
    pub hostname: String,
    /// Service name
    pub service: String,
    /// Severity level (info, warn, error)
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "petrel-tftpd".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    /// Log this audit event as structured JSON through tracing.
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"Failed to serialize audit event: {:?}\"}}", self)
        });

        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::FileSizeLimitExceeded { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

/// Audit logger for TFTP operations
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &str, root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn read_request(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: serde_json::Value,
    ) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn write_request(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: serde_json::Value,
    ) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn request_denied(client_addr: SocketAddr, filename: &str, direction: &str, reason: &str) {
        AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transfer_started(
        client_addr: SocketAddr,
        filename: &str,
        direction: &str,
        file_size: u64,
        mode: &str,
        block_size: usize,
        window_size: usize,
    ) {
        AuditEvent::TransferStarted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            file_size,
            mode: mode.to_string(),
            block_size,
            window_size,
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        direction: &str,
        bytes_transferred: u64,
        duration_ms: u64,
    ) {
        let throughput_bps = if duration_ms > 0 {
            (bytes_transferred * 1000) / duration_ms
        } else {
            0
        };
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            bytes_transferred,
            duration_ms,
            throughput_bps,
        }
        .log();
    }

    pub fn transfer_failed(
        client_addr: SocketAddr,
        filename: &str,
        direction: &str,
        error: &str,
        bytes_transferred: u64,
    ) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            error: error.to_string(),
            bytes_transferred,
        }
        .log();
    }

    pub fn path_traversal_attempt(client_addr: SocketAddr, requested_path: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        }
        .log();
    }

    pub fn file_size_limit_exceeded(
        client_addr: SocketAddr,
        filename: &str,
        file_size: u64,
        max_allowed: u64,
    ) {
        AuditEvent::FileSizeLimitExceeded {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            file_size,
            max_allowed,
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }
}
