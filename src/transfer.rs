//! Per-transfer protocol engine.
//!
//! One [`Transfer`] drives a single RRQ or WRQ from acceptance to a terminal
//! state. The read side keeps a send window of in-flight DATA blocks with
//! per-block retry accounting (RFC 7440); the write side tracks the expected
//! block and re-emits its last ACK on a retry budget. The dispatcher feeds
//! the engine through `on_packet` and `on_tick`; the engine talks back
//! through a [`SendHandle`] and never touches the listening socket directly.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::monitor::Monitor;
use crate::netascii;
use crate::packet::{self, Packet, Request, RequestOptions};
use crate::server::SendHandle;
use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_WINDOW_SIZE, ErrorCode, MIN_BLOCK_SIZE, TransferDirection,
    TransferMode,
};

/// Server-side ceilings and defaults a transfer negotiates against.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    /// Ceiling for RFC 2348 blksize negotiation
    pub block_size_ceiling: usize,
    /// Ceiling for RFC 7440 windowsize negotiation
    pub window_size_ceiling: usize,
    /// Retransmission interval when the client negotiates none
    pub default_timeout: Duration,
    pub max_retries: u32,
    /// 0 = unlimited
    pub max_file_size: u64,
    pub overwrite_protection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Initialized,
    Connected,
    /// OACK sent on an RRQ; waiting for ACK(0) before streaming
    AwaitingOackAck,
    Transferring,
    Completed,
    Errored,
    Closed,
}

#[derive(Debug)]
struct InFlightBlock {
    payload: Bytes,
    is_final: bool,
    last_sent: Instant,
    retries: u32,
}

#[derive(Debug)]
struct ReadState {
    file: Option<File>,
    encoder: Option<netascii::Encoder>,
    /// Translated bytes not yet cut into blocks
    pending: Vec<u8>,
    eof: bool,
    in_flight: BTreeMap<u16, InFlightBlock>,
    next_block: u16,
    last_ack_block: u16,
    final_block: Option<u16>,
    oack: Option<Bytes>,
    oack_sent: Instant,
    oack_retries: u32,
}

#[derive(Debug)]
struct WriteState {
    file: Option<File>,
    decoder: Option<netascii::Decoder>,
    expected_block: u16,
    /// Last committed block; 0 before any data
    current_block: u16,
    last_ack_block: u16,
    ack_retries: u32,
    last_ack_time: Instant,
    /// OACK bytes re-sent on timeout until the first DATA commits
    oack: Option<Bytes>,
    /// The target was opened by this transfer; partial-write cleanup only
    /// removes files we own
    created: bool,
}

#[derive(Debug)]
enum Side {
    Read(ReadState),
    Write(WriteState),
}

pub struct Transfer {
    peer: SocketAddr,
    filename: String,
    path: PathBuf,
    direction: TransferDirection,
    mode: TransferMode,
    state: TransferState,
    side: Side,
    limits: TransferLimits,
    // negotiated parameters
    block_size: usize,
    window_size: usize,
    timeout: Duration,
    max_retries: u32,
    advertised_tsize: u64,
    bytes_transferred: u64,
    started: Instant,
    last_activity: Instant,
    send: SendHandle,
    monitor: Arc<Monitor>,
    audit_enabled: bool,
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: SocketAddr,
        request: &Request,
        direction: TransferDirection,
        path: PathBuf,
        limits: TransferLimits,
        send: SendHandle,
        monitor: Arc<Monitor>,
        audit_enabled: bool,
    ) -> Self {
        let now = Instant::now();
        let side = match direction {
            TransferDirection::Read => Side::Read(ReadState {
                file: None,
                encoder: None,
                pending: Vec::new(),
                eof: false,
                in_flight: BTreeMap::new(),
                next_block: 1,
                last_ack_block: 0,
                final_block: None,
                oack: None,
                oack_sent: now,
                oack_retries: 0,
            }),
            TransferDirection::Write => Side::Write(WriteState {
                file: None,
                decoder: None,
                expected_block: 1,
                current_block: 0,
                last_ack_block: 0,
                ack_retries: 0,
                last_ack_time: now,
                oack: None,
                created: false,
            }),
        };
        let max_retries = limits.max_retries;
        let timeout = limits.default_timeout;
        Self {
            peer,
            filename: request.filename.clone(),
            path,
            direction,
            mode: request.mode,
            state: TransferState::Initialized,
            side,
            limits,
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            timeout,
            max_retries,
            advertised_tsize: 0,
            bytes_transferred: 0,
            started: now,
            last_activity: now,
            send,
            monitor,
            audit_enabled,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TransferState::Completed | TransferState::Errored | TransferState::Closed
        )
    }

    /// Composite idle cutoff, independent of per-block retry accounting.
    pub fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > self.timeout * (self.max_retries + 1)
    }

    /// Open the file and send the first response (OACK, ACK(0) or DATA).
    pub async fn start(&mut self, options: &RequestOptions) {
        match self.direction {
            TransferDirection::Read => self.start_read(options).await,
            TransferDirection::Write => self.start_write(options).await,
        }
    }

    /// Route one inbound packet from this transfer's peer.
    pub async fn on_packet(&mut self, packet: Packet) {
        if self.is_terminal() {
            return;
        }
        self.last_activity = Instant::now();
        match packet {
            Packet::Ack { block } => self.on_ack(block).await,
            Packet::Data { block, payload } => self.on_data(block, payload).await,
            Packet::Error { code, message } => {
                warn!(peer = %self.peer, code = ?code, message, "peer aborted transfer");
                self.abort_local(&format!("peer error: {}", message)).await;
            }
            Packet::Rrq(_) | Packet::Wrq(_) | Packet::Oack { .. } => {
                self.protocol_violation("unexpected packet type").await;
            }
        }
    }

    /// Timer edge. `now` is passed in so retransmission is testable.
    pub async fn on_tick(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }

        if self.idle_expired(now) {
            self.fail_timeout("transfer idle timeout").await;
            return;
        }

        match self.direction {
            TransferDirection::Read => self.tick_read(now).await,
            TransferDirection::Write => self.tick_write(now).await,
        }
    }

    /// Orderly shutdown: close handles, no wire traffic.
    pub async fn close(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.close_files().await;
        self.remove_partial_write().await;
        self.state = TransferState::Closed;
        debug!(peer = %self.peer, filename = %self.filename, "transfer closed");
    }

    // ---- RRQ path -------------------------------------------------------

    async fn start_read(&mut self, options: &RequestOptions) {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.fail(ErrorCode::FileNotFound, "File not found").await;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                self.fail(ErrorCode::AccessViolation, "Access denied").await;
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to open file for reading");
                self.fail(ErrorCode::NotDefined, "Failed to open file").await;
                return;
            }
        };

        let file_size = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to stat file");
                self.fail(ErrorCode::NotDefined, "Failed to open file").await;
                return;
            }
        };

        if self.limits.max_file_size > 0 && file_size > self.limits.max_file_size {
            if self.audit_enabled {
                AuditLogger::file_size_limit_exceeded(
                    self.peer,
                    &self.filename,
                    file_size,
                    self.limits.max_file_size,
                );
            }
            self.fail(ErrorCode::DiskFull, "File too large").await;
            return;
        }

        let agreed = self.negotiate(options, Some(file_size));
        self.state = TransferState::Connected;
        {
            let Side::Read(rs) = &mut self.side else { return };
            rs.file = Some(file);
            if self.mode.is_translated() {
                rs.encoder = Some(netascii::Encoder::new());
            }
        }

        if self.audit_enabled {
            AuditLogger::transfer_started(
                self.peer,
                &self.filename,
                self.direction.as_str(),
                file_size,
                self.mode.as_str(),
                self.block_size,
                self.window_size,
            );
        }

        if agreed.is_empty() {
            self.state = TransferState::Transferring;
            self.fill_window().await;
        } else {
            let oack_bytes = packet::encode(&Packet::Oack { options: agreed });
            if self.send.send_bytes(&oack_bytes).await.is_err() {
                self.abort_local("network send failed").await;
                return;
            }
            let now = Instant::now();
            let Side::Read(rs) = &mut self.side else { return };
            rs.oack = Some(oack_bytes);
            rs.oack_sent = now;
            self.state = TransferState::AwaitingOackAck;
            self.last_activity = now;
        }
    }

    /// Keep up to `window_size` blocks in flight, in strictly ascending
    /// block order. A translated payload shorter than the block size marks
    /// the final block; an exact-multiple file ends with an empty one.
    async fn fill_window(&mut self) {
        loop {
            let wants_more = {
                let Side::Read(rs) = &self.side else { return };
                rs.final_block.is_none() && rs.in_flight.len() < self.window_size
            };
            if !wants_more {
                return;
            }

            let produced = {
                let Side::Read(rs) = &mut self.side else { return };
                Self::next_block_payload(rs, self.block_size).await
            };
            let (payload, is_final) = match produced {
                Ok(block) => block,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "file read failed mid-transfer");
                    self.fail(ErrorCode::NotDefined, "File read error").await;
                    return;
                }
            };

            let payload = Bytes::from(payload);
            let block = {
                let Side::Read(rs) = &mut self.side else { return };
                let block = rs.next_block;
                rs.in_flight.insert(
                    block,
                    InFlightBlock {
                        payload: payload.clone(),
                        is_final,
                        last_sent: Instant::now(),
                        retries: 0,
                    },
                );
                if is_final {
                    rs.final_block = Some(block);
                }
                rs.next_block = block.wrapping_add(1);
                block
            };

            self.bytes_transferred += payload.len() as u64;
            let len = payload.len();
            let data = packet::encode(&Packet::Data { block, payload });
            if self.send.send_bytes(&data).await.is_err() {
                self.abort_local("network send failed").await;
                return;
            }
            self.last_activity = Instant::now();
            debug!(peer = %self.peer, block, len, is_final, "sent DATA");
        }
    }

    /// Produce the next translated payload of up to `block_size` bytes.
    async fn next_block_payload(
        rs: &mut ReadState,
        block_size: usize,
    ) -> std::io::Result<(Vec<u8>, bool)> {
        while rs.pending.len() < block_size && !rs.eof {
            let Some(file) = rs.file.as_mut() else {
                rs.eof = true;
                break;
            };
            let mut buf = vec![0u8; block_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                rs.eof = true;
                break;
            }
            match rs.encoder.as_mut() {
                Some(encoder) => encoder.push(&buf[..n], &mut rs.pending),
                None => rs.pending.extend_from_slice(&buf[..n]),
            }
        }

        let take = rs.pending.len().min(block_size);
        let payload: Vec<u8> = rs.pending.drain(..take).collect();
        let is_final = payload.len() < block_size;
        Ok((payload, is_final))
    }

    async fn on_ack(&mut self, block: u16) {
        if self.direction != TransferDirection::Read {
            self.protocol_violation("unexpected ACK").await;
            return;
        }

        if self.state == TransferState::AwaitingOackAck {
            if block == 0 {
                {
                    let Side::Read(rs) = &mut self.side else { return };
                    rs.oack = None;
                    rs.oack_retries = 0;
                }
                self.state = TransferState::Transferring;
                self.fill_window().await;
            }
            return;
        }

        enum Outcome {
            Duplicate,
            Progress,
            Complete,
        }

        let outcome = {
            let Side::Read(rs) = &mut self.side else { return };
            // Cumulative interpretation: ACK(n) retires every in-flight
            // block the window places at or before n.
            let window = self.window_size.min(usize::from(u16::MAX)) as u16;
            let acked: Vec<u16> = rs
                .in_flight
                .keys()
                .copied()
                .filter(|&k| block.wrapping_sub(k) < window)
                .collect();
            if acked.is_empty() {
                Outcome::Duplicate
            } else {
                let mut final_acked = false;
                for k in acked {
                    if let Some(entry) = rs.in_flight.remove(&k)
                        && entry.is_final
                    {
                        final_acked = true;
                    }
                }
                rs.last_ack_block = block;
                if final_acked && rs.in_flight.is_empty() {
                    Outcome::Complete
                } else {
                    Outcome::Progress
                }
            }
        };

        match outcome {
            Outcome::Duplicate => debug!(peer = %self.peer, block, "duplicate ACK ignored"),
            Outcome::Progress => self.fill_window().await,
            Outcome::Complete => self.complete().await,
        }
    }

    async fn tick_read(&mut self, now: Instant) {
        if self.state == TransferState::AwaitingOackAck {
            let resend = {
                let Side::Read(rs) = &mut self.side else { return };
                if now.duration_since(rs.oack_sent) < self.timeout {
                    return;
                }
                if rs.oack_retries >= self.max_retries {
                    None
                } else {
                    rs.oack_retries += 1;
                    rs.oack_sent = now;
                    rs.oack.clone()
                }
            };
            match resend {
                Some(bytes) => {
                    if self.send.send_bytes(&bytes).await.is_err() {
                        self.abort_local("network send failed").await;
                    }
                }
                None => self.fail_timeout("client never acknowledged options").await,
            }
            return;
        }

        let mut exhausted = false;
        let mut to_resend: Vec<(u16, Bytes)> = Vec::new();
        {
            let Side::Read(rs) = &mut self.side else { return };
            for (&block, entry) in rs.in_flight.iter_mut() {
                if now.duration_since(entry.last_sent) < self.timeout {
                    continue;
                }
                if entry.retries >= self.max_retries {
                    exhausted = true;
                    break;
                }
                entry.retries += 1;
                entry.last_sent = now;
                to_resend.push((
                    block,
                    packet::encode(&Packet::Data {
                        block,
                        payload: entry.payload.clone(),
                    }),
                ));
            }
        }

        if exhausted {
            self.fail_timeout("retry limit exceeded").await;
            return;
        }

        for (block, bytes) in to_resend {
            if self.send.send_bytes(&bytes).await.is_err() {
                self.abort_local("network send failed").await;
                return;
            }
            debug!(peer = %self.peer, block, "retransmitted DATA");
        }
    }

    // ---- WRQ path -------------------------------------------------------

    async fn start_write(&mut self, options: &RequestOptions) {
        if let Some(tsize) = options.tsize
            && self.limits.max_file_size > 0
            && tsize > self.limits.max_file_size
        {
            if self.audit_enabled {
                AuditLogger::file_size_limit_exceeded(
                    self.peer,
                    &self.filename,
                    tsize,
                    self.limits.max_file_size,
                );
            }
            self.fail(ErrorCode::DiskFull, "Requested transfer size exceeds server limit")
                .await;
            return;
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && tokio::fs::create_dir_all(parent).await.is_err()
        {
            self.fail(ErrorCode::NotDefined, "Failed to create directory")
                .await;
            return;
        }

        let mut open_options = tokio::fs::OpenOptions::new();
        open_options.write(true);
        if self.limits.overwrite_protection {
            // create_new is the atomic half of overwrite protection; the
            // policy existence check only produces the early refusal
            open_options.create_new(true);
        } else {
            open_options.create(true).truncate(true);
        }

        let file = match open_options.open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.fail(ErrorCode::FileAlreadyExists, "File already exists")
                    .await;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                self.fail(ErrorCode::AccessViolation, "Access denied").await;
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to open file for writing");
                self.fail(ErrorCode::NotDefined, "Failed to open file").await;
                return;
            }
        };

        let agreed = self.negotiate(options, None);
        self.state = TransferState::Connected;
        {
            let Side::Write(ws) = &mut self.side else { return };
            ws.file = Some(file);
            ws.created = true;
            if self.mode.is_translated() {
                ws.decoder = Some(netascii::Decoder::new());
            }
        }

        if self.audit_enabled {
            AuditLogger::transfer_started(
                self.peer,
                &self.filename,
                self.direction.as_str(),
                self.advertised_tsize,
                self.mode.as_str(),
                self.block_size,
                self.window_size,
            );
        }

        let negotiated = !agreed.is_empty();
        let control = if negotiated {
            packet::encode(&Packet::Oack { options: agreed })
        } else {
            packet::encode(&Packet::Ack { block: 0 })
        };
        if self.send.send_bytes(&control).await.is_err() {
            self.abort_local("network send failed").await;
            return;
        }

        let now = Instant::now();
        {
            let Side::Write(ws) = &mut self.side else { return };
            if negotiated {
                ws.oack = Some(control);
            }
            ws.last_ack_block = 0;
            ws.last_ack_time = now;
            ws.expected_block = 1;
        }
        self.state = TransferState::Transferring;
        self.last_activity = now;
    }

    async fn on_data(&mut self, block: u16, payload: Bytes) {
        if self.direction != TransferDirection::Write {
            self.protocol_violation("unexpected DATA").await;
            return;
        }
        if payload.len() > self.block_size {
            self.protocol_violation("DATA payload exceeds negotiated block size")
                .await;
            return;
        }

        enum Outcome {
            ReAck(u16),
            Commit { translated: Vec<u8>, is_final: bool },
        }

        let is_final = payload.len() < self.block_size;
        let outcome = {
            let Side::Write(ws) = &mut self.side else { return };
            if block == ws.current_block {
                // duplicate of the last committed block; do not re-write
                Outcome::ReAck(block)
            } else if block != ws.expected_block {
                // out of order; steer the client back without committing
                Outcome::ReAck(ws.current_block)
            } else {
                let mut translated = Vec::with_capacity(payload.len());
                match ws.decoder.as_mut() {
                    Some(decoder) => {
                        decoder.push(&payload, &mut translated);
                        if is_final {
                            decoder.finish();
                        }
                    }
                    None => translated.extend_from_slice(&payload),
                }
                Outcome::Commit {
                    translated,
                    is_final,
                }
            }
        };

        match outcome {
            Outcome::ReAck(n) => {
                debug!(peer = %self.peer, block, reack = n, "re-acknowledged without writing");
                let _ = self.send_packet(&Packet::Ack { block: n }).await;
            }
            Outcome::Commit {
                translated,
                is_final,
            } => {
                let attempted = self.bytes_transferred + translated.len() as u64;
                if self.limits.max_file_size > 0 && attempted > self.limits.max_file_size {
                    if self.audit_enabled {
                        AuditLogger::file_size_limit_exceeded(
                            self.peer,
                            &self.filename,
                            attempted,
                            self.limits.max_file_size,
                        );
                    }
                    self.fail(ErrorCode::DiskFull, "File exceeds configured size limit")
                        .await;
                    return;
                }
                if self.advertised_tsize > 0 && attempted > self.advertised_tsize {
                    self.fail(ErrorCode::DiskFull, "Transfer exceeds advertised size")
                        .await;
                    return;
                }

                let write_result = {
                    let Side::Write(ws) = &mut self.side else { return };
                    match ws.file.as_mut() {
                        Some(file) => file.write_all(&translated).await,
                        None => Ok(()),
                    }
                };
                if write_result.is_err() {
                    self.fail(ErrorCode::DiskFull, "Failed to write data").await;
                    return;
                }

                self.bytes_transferred = attempted;
                {
                    let Side::Write(ws) = &mut self.side else { return };
                    ws.current_block = block;
                    ws.expected_block = block.wrapping_add(1);
                    ws.last_ack_block = block;
                    ws.ack_retries = 0;
                    ws.last_ack_time = Instant::now();
                    ws.oack = None;
                }
                if self.send_packet(&Packet::Ack { block }).await.is_err() {
                    self.abort_local("network send failed").await;
                    return;
                }
                debug!(peer = %self.peer, block, bytes = self.bytes_transferred, "committed DATA");

                if is_final {
                    self.complete().await;
                }
            }
        }
    }

    async fn tick_write(&mut self, now: Instant) {
        enum Resend {
            Oack(Bytes),
            Ack(u16),
        }

        let action = {
            let Side::Write(ws) = &mut self.side else { return };
            if now.duration_since(ws.last_ack_time) < self.timeout {
                return;
            }
            if ws.ack_retries >= self.max_retries {
                None
            } else {
                ws.ack_retries += 1;
                ws.last_ack_time = now;
                match &ws.oack {
                    Some(bytes) => Some(Resend::Oack(bytes.clone())),
                    None => Some(Resend::Ack(ws.last_ack_block)),
                }
            }
        };

        match action {
            None => self.fail_timeout("client did not continue transfer").await,
            Some(Resend::Oack(bytes)) => {
                debug!(peer = %self.peer, "retransmitted OACK");
                if self.send.send_bytes(&bytes).await.is_err() {
                    self.abort_local("network send failed").await;
                }
            }
            Some(Resend::Ack(block)) => {
                debug!(peer = %self.peer, block, "retransmitted ACK");
                if self.send_packet(&Packet::Ack { block }).await.is_err() {
                    self.abort_local("network send failed").await;
                }
            }
        }
    }

    // ---- shared ---------------------------------------------------------

    /// Per-option min(client request, server ceiling), clamped to protocol
    /// ranges. Returns the (name, value) pairs the OACK echoes.
    fn negotiate(
        &mut self,
        options: &RequestOptions,
        file_size: Option<u64>,
    ) -> Vec<(String, String)> {
        let mut agreed = Vec::new();

        if let Some(requested) = options.blksize {
            let chosen = (requested as usize)
                .min(self.limits.block_size_ceiling)
                .max(MIN_BLOCK_SIZE);
            self.block_size = chosen;
            agreed.push(("blksize".to_string(), chosen.to_string()));
        }

        if let Some(requested) = options.timeout {
            self.timeout = Duration::from_secs(u64::from(requested));
            agreed.push(("timeout".to_string(), requested.to_string()));
        }

        if let Some(requested) = options.tsize {
            match file_size {
                // RRQ: answer with the actual file size
                Some(size) => agreed.push(("tsize".to_string(), size.to_string())),
                // WRQ: record the advertised size and echo it
                None => {
                    self.advertised_tsize = requested;
                    agreed.push(("tsize".to_string(), requested.to_string()));
                }
            }
        }

        if let Some(requested) = options.windowsize {
            let chosen = (requested as usize)
                .min(self.limits.window_size_ceiling)
                .max(1);
            self.window_size = chosen;
            agreed.push(("windowsize".to_string(), chosen.to_string()));
        }

        agreed
    }

    async fn send_packet(&self, packet: &Packet) -> std::io::Result<()> {
        self.send.send_bytes(&packet::encode(packet)).await
    }

    async fn protocol_violation(&mut self, what: &str) {
        if self.audit_enabled {
            AuditLogger::protocol_violation(self.peer, what);
        }
        self.fail(ErrorCode::IllegalOperation, what).await;
    }

    /// Transfer-level failure: exactly one wire ERROR, then terminal state.
    async fn fail(&mut self, code: ErrorCode, message: &str) {
        let _ = self
            .send_packet(&Packet::Error {
                code,
                message: message.to_string(),
            })
            .await;
        self.finish_error(message).await;
    }

    async fn fail_timeout(&mut self, reason: &str) {
        warn!(peer = %self.peer, filename = %self.filename, reason, "transfer timed out");
        self.monitor.record_timeout();
        let _ = self
            .send_packet(&Packet::Error {
                code: ErrorCode::NotDefined,
                message: "timeout".to_string(),
            })
            .await;
        self.finish_error(reason).await;
    }

    /// Local teardown without a wire ERROR (peer error, send failure).
    async fn abort_local(&mut self, reason: &str) {
        self.finish_error(reason).await;
    }

    async fn finish_error(&mut self, reason: &str) {
        self.close_files().await;
        self.remove_partial_write().await;
        self.state = TransferState::Errored;
        self.monitor.record_error();
        self.monitor.record_transfer(
            self.bytes_transferred,
            false,
            self.started.elapsed().as_millis() as u64,
        );
        if self.audit_enabled {
            AuditLogger::transfer_failed(
                self.peer,
                &self.filename,
                self.direction.as_str(),
                reason,
                self.bytes_transferred,
            );
        }
    }

    async fn complete(&mut self) {
        if let Side::Write(ws) = &mut self.side
            && let Some(mut file) = ws.file.take()
        {
            let _ = file.flush().await;
            let _ = file.sync_all().await;
        }
        self.close_files().await;
        self.state = TransferState::Completed;
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.monitor
            .record_transfer(self.bytes_transferred, true, duration_ms);
        if self.audit_enabled {
            AuditLogger::transfer_completed(
                self.peer,
                &self.filename,
                self.direction.as_str(),
                self.bytes_transferred,
                duration_ms,
            );
        }
        debug!(
            peer = %self.peer,
            filename = %self.filename,
            bytes = self.bytes_transferred,
            "transfer completed"
        );
    }

    async fn close_files(&mut self) {
        match &mut self.side {
            Side::Read(rs) => {
                rs.file = None;
            }
            Side::Write(ws) => {
                if let Some(mut file) = ws.file.take() {
                    let _ = file.flush().await;
                }
            }
        }
    }

    /// A write that did not complete leaves no half-written target behind.
    /// Only files this transfer opened are removed; a refused overwrite
    /// never touches the existing target.
    async fn remove_partial_write(&mut self) {
        if self.state == TransferState::Completed {
            return;
        }
        if let Side::Write(ws) = &self.side
            && ws.created
        {
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct Harness {
        client: tokio::net::UdpSocket,
        server_socket: Arc<tokio::net::UdpSocket>,
        peer: SocketAddr,
        dir: PathBuf,
        monitor: Arc<Monitor>,
    }

    async fn harness(name: &str) -> Harness {
        let server_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();
        let dir = std::env::temp_dir().join(format!(
            "petrel_transfer_{}_{}",
            name,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Harness {
            client,
            server_socket,
            peer,
            dir,
            monitor: Arc::new(Monitor::new()),
        }
    }

    fn limits() -> TransferLimits {
        TransferLimits {
            block_size_ceiling: 8192,
            window_size_ceiling: 8,
            default_timeout: Duration::from_secs(1),
            max_retries: 3,
            max_file_size: 0,
            overwrite_protection: true,
        }
    }

    impl Harness {
        fn transfer(
            &self,
            filename: &str,
            direction: TransferDirection,
            mode: TransferMode,
            options: RequestOptions,
            limits: TransferLimits,
        ) -> Transfer {
            let request = Request {
                filename: filename.to_string(),
                mode,
                options,
            };
            Transfer::new(
                self.peer,
                &request,
                direction,
                self.dir.join(filename),
                limits,
                SendHandle::new(Arc::clone(&self.server_socket), self.peer),
                Arc::clone(&self.monitor),
                false,
            )
        }

        async fn recv(&self) -> Packet {
            let mut buf = vec![0u8; 70000];
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(2),
                self.client.recv_from(&mut buf),
            )
            .await
            .expect("timed out waiting for a datagram")
            .expect("recv failed");
            packet::decode(&buf[..len]).expect("undecodable datagram")
        }

        async fn expect_data(&self, block: u16) -> Bytes {
            match self.recv().await {
                Packet::Data {
                    block: got,
                    payload,
                } => {
                    assert_eq!(got, block, "unexpected DATA block number");
                    payload
                }
                other => panic!("expected DATA({}), got {:?}", block, other),
            }
        }

        async fn expect_ack(&self, block: u16) {
            match self.recv().await {
                Packet::Ack { block: got } => assert_eq!(got, block),
                other => panic!("expected ACK({}), got {:?}", block, other),
            }
        }

        async fn expect_error(&self, code: ErrorCode) -> String {
            match self.recv().await {
                Packet::Error {
                    code: got,
                    message,
                } => {
                    assert_eq!(got, code, "unexpected error code: {}", message);
                    message
                }
                other => panic!("expected ERROR({:?}), got {:?}", code, other),
            }
        }

        async fn expect_silence(&self) {
            let mut buf = vec![0u8; 70000];
            let outcome = tokio::time::timeout(
                Duration::from_millis(200),
                self.client.recv_from(&mut buf),
            )
            .await;
            assert!(outcome.is_err(), "expected no datagram");
        }
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn read_small_file_completes_after_single_ack() {
        let h = harness("read-small").await;
        write_file(&h.dir, "hello.txt", b"Hello, TFTP World!");

        let mut t = h.transfer(
            "hello.txt",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        let payload = h.expect_data(1).await;
        assert_eq!(&payload[..], b"Hello, TFTP World!");

        t.on_packet(Packet::Ack { block: 1 }).await;
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 18);
    }

    #[tokio::test]
    async fn exact_multiple_file_ends_with_empty_block() {
        let h = harness("read-exact").await;
        write_file(&h.dir, "image.bin", &vec![7u8; 1024]);

        let mut t = h.transfer(
            "image.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        assert_eq!(h.expect_data(1).await.len(), 512);
        t.on_packet(Packet::Ack { block: 1 }).await;
        assert_eq!(h.expect_data(2).await.len(), 512);
        t.on_packet(Packet::Ack { block: 2 }).await;
        assert_eq!(h.expect_data(3).await.len(), 0);
        t.on_packet(Packet::Ack { block: 3 }).await;

        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 1024);
    }

    #[tokio::test]
    async fn options_produce_oack_and_gate_on_ack_zero() {
        let h = harness("read-oack").await;
        write_file(&h.dir, "big.bin", &vec![1u8; 3000]);

        let options = RequestOptions {
            blksize: Some(1024),
            timeout: None,
            tsize: Some(0),
            windowsize: Some(4),
        };
        let mut t = h.transfer(
            "big.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            options,
            limits(),
        );
        t.start(&options).await;

        match h.recv().await {
            Packet::Oack { options } => {
                assert!(options.contains(&("blksize".to_string(), "1024".to_string())));
                assert!(options.contains(&("tsize".to_string(), "3000".to_string())));
                assert!(options.contains(&("windowsize".to_string(), "4".to_string())));
            }
            other => panic!("expected OACK, got {:?}", other),
        }
        assert_eq!(t.state(), TransferState::AwaitingOackAck);

        t.on_packet(Packet::Ack { block: 0 }).await;
        assert_eq!(t.state(), TransferState::Transferring);

        assert_eq!(h.expect_data(1).await.len(), 1024);
        assert_eq!(h.expect_data(2).await.len(), 1024);
        assert_eq!(h.expect_data(3).await.len(), 952);

        t.on_packet(Packet::Ack { block: 3 }).await;
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 3000);
    }

    #[tokio::test]
    async fn windowsize_is_clamped_to_server_ceiling() {
        let h = harness("read-clamp").await;
        write_file(&h.dir, "f.bin", &[9u8; 64]);

        let options = RequestOptions {
            windowsize: Some(64),
            blksize: Some(65464),
            ..RequestOptions::default()
        };
        let mut t = h.transfer(
            "f.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            options,
            limits(),
        );
        t.start(&options).await;

        match h.recv().await {
            Packet::Oack { options } => {
                assert!(options.contains(&("windowsize".to_string(), "8".to_string())));
                assert!(options.contains(&("blksize".to_string(), "8192".to_string())));
            }
            other => panic!("expected OACK, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cumulative_ack_retires_earlier_blocks() {
        let h = harness("read-window").await;
        write_file(&h.dir, "w.bin", &vec![3u8; 2304]); // 4 full blocks + 256

        let options = RequestOptions {
            windowsize: Some(4),
            ..RequestOptions::default()
        };
        let mut t = h.transfer(
            "w.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            options,
            limits(),
        );
        t.start(&options).await;

        match h.recv().await {
            Packet::Oack { .. } => {}
            other => panic!("expected OACK, got {:?}", other),
        }
        t.on_packet(Packet::Ack { block: 0 }).await;

        for block in 1..=4u16 {
            assert_eq!(h.expect_data(block).await.len(), 512);
        }

        // ACK(2) retires blocks 1 and 2, opening room for the final block
        t.on_packet(Packet::Ack { block: 2 }).await;
        assert_eq!(h.expect_data(5).await.len(), 256);

        t.on_packet(Packet::Ack { block: 5 }).await;
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 2304);
    }

    #[tokio::test]
    async fn duplicate_ack_is_ignored() {
        let h = harness("read-dup-ack").await;
        write_file(&h.dir, "d.bin", &vec![5u8; 700]);

        let mut t = h.transfer(
            "d.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        assert_eq!(h.expect_data(1).await.len(), 512);
        t.on_packet(Packet::Ack { block: 1 }).await;
        assert_eq!(h.expect_data(2).await.len(), 188);

        // stale ACK for an already-retired block changes nothing
        t.on_packet(Packet::Ack { block: 1 }).await;
        assert_eq!(t.state(), TransferState::Transferring);
        h.expect_silence().await;

        t.on_packet(Packet::Ack { block: 2 }).await;
        assert_eq!(t.state(), TransferState::Completed);
    }

    #[tokio::test]
    async fn lost_ack_triggers_retransmission_then_timeout() {
        let h = harness("read-retry").await;
        write_file(&h.dir, "r.bin", &[2u8; 100]);

        let mut t = h.transfer(
            "r.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        assert_eq!(h.expect_data(1).await.len(), 100);

        let base = Instant::now();
        for retry in 1..=3u32 {
            t.on_tick(base + Duration::from_millis(1100 * u64::from(retry))).await;
            assert_eq!(h.expect_data(1).await.len(), 100, "retry {}", retry);
        }

        // retry budget spent; the next due tick tears the transfer down
        t.on_tick(base + Duration::from_millis(4500)).await;
        let message = h.expect_error(ErrorCode::NotDefined).await;
        assert_eq!(message, "timeout");
        assert_eq!(t.state(), TransferState::Errored);
        assert!(h.monitor.snapshot().timeouts >= 1);
    }

    #[tokio::test]
    async fn read_missing_file_reports_not_found() {
        let h = harness("read-missing").await;
        let mut t = h.transfer(
            "absent.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        h.expect_error(ErrorCode::FileNotFound).await;
        assert_eq!(t.state(), TransferState::Errored);
    }

    #[tokio::test]
    async fn read_netascii_translates_line_endings() {
        let h = harness("read-netascii").await;
        write_file(&h.dir, "notes.txt", b"a\nb\n");

        let mut t = h.transfer(
            "notes.txt",
            TransferDirection::Read,
            TransferMode::Netascii,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        let payload = h.expect_data(1).await;
        assert_eq!(&payload[..], b"a\r\nb\r\n");

        t.on_packet(Packet::Ack { block: 1 }).await;
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 6);
    }

    #[tokio::test]
    async fn peer_error_terminates_silently() {
        let h = harness("read-peer-error").await;
        write_file(&h.dir, "p.bin", &[1u8; 64]);

        let mut t = h.transfer(
            "p.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_data(1).await;

        t.on_packet(Packet::Error {
            code: ErrorCode::DiskFull,
            message: "client gave up".to_string(),
        })
        .await;
        assert_eq!(t.state(), TransferState::Errored);
        h.expect_silence().await;
    }

    #[tokio::test]
    async fn write_commits_blocks_and_completes() {
        let h = harness("write-basic").await;
        let mut t = h.transfer(
            "upload.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_ack(0).await;

        let full = Bytes::from(vec![0xAAu8; 512]);
        t.on_packet(Packet::Data {
            block: 1,
            payload: full.clone(),
        })
        .await;
        h.expect_ack(1).await;

        // duplicate of the committed block re-acks without re-writing
        t.on_packet(Packet::Data {
            block: 1,
            payload: full.clone(),
        })
        .await;
        h.expect_ack(1).await;

        // out-of-order block steers the client back to the committed one
        t.on_packet(Packet::Data {
            block: 3,
            payload: Bytes::from_static(b"xxxx"),
        })
        .await;
        h.expect_ack(1).await;

        t.on_packet(Packet::Data {
            block: 2,
            payload: Bytes::from_static(b"tail"),
        })
        .await;
        h.expect_ack(2).await;
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 516);

        let written = std::fs::read(h.dir.join("upload.bin")).unwrap();
        assert_eq!(written.len(), 516);
        assert_eq!(&written[..512], &vec![0xAAu8; 512][..]);
        assert_eq!(&written[512..], b"tail");
    }

    #[tokio::test]
    async fn write_with_options_answers_oack() {
        let h = harness("write-oack").await;
        let options = RequestOptions {
            blksize: Some(1024),
            tsize: Some(2000),
            ..RequestOptions::default()
        };
        let mut t = h.transfer(
            "upload.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            options,
            limits(),
        );
        t.start(&options).await;

        match h.recv().await {
            Packet::Oack { options } => {
                assert!(options.contains(&("blksize".to_string(), "1024".to_string())));
                assert!(options.contains(&("tsize".to_string(), "2000".to_string())));
            }
            other => panic!("expected OACK, got {:?}", other),
        }

        // no ACK(0) gate on WRQ; DATA(1) follows the OACK directly
        t.on_packet(Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"short"),
        })
        .await;
        h.expect_ack(1).await;
        assert_eq!(t.state(), TransferState::Completed);
    }

    #[tokio::test]
    async fn write_exceeding_size_limit_draws_disk_full() {
        let h = harness("write-limit").await;
        let mut bounded = limits();
        bounded.max_file_size = 600;

        let mut t = h.transfer(
            "big.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            RequestOptions::default(),
            bounded,
        );
        t.start(&RequestOptions::default()).await;
        h.expect_ack(0).await;

        t.on_packet(Packet::Data {
            block: 1,
            payload: Bytes::from(vec![0u8; 512]),
        })
        .await;
        h.expect_ack(1).await;

        t.on_packet(Packet::Data {
            block: 2,
            payload: Bytes::from(vec![0u8; 512]),
        })
        .await;
        h.expect_error(ErrorCode::DiskFull).await;
        assert_eq!(t.state(), TransferState::Errored);
        // the partial file is cleaned up
        assert!(!h.dir.join("big.bin").exists());
    }

    #[tokio::test]
    async fn write_rejects_advertised_tsize_above_limit() {
        let h = harness("write-tsize").await;
        let mut bounded = limits();
        bounded.max_file_size = 100;

        let options = RequestOptions {
            tsize: Some(1000),
            ..RequestOptions::default()
        };
        let mut t = h.transfer(
            "big.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            options,
            bounded,
        );
        t.start(&options).await;

        h.expect_error(ErrorCode::DiskFull).await;
        assert_eq!(t.state(), TransferState::Errored);
    }

    #[tokio::test]
    async fn write_existing_file_with_protection_draws_file_exists() {
        let h = harness("write-exists").await;
        write_file(&h.dir, "config.bin", b"old");

        let mut t = h.transfer(
            "config.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;

        h.expect_error(ErrorCode::FileAlreadyExists).await;
        assert_eq!(t.state(), TransferState::Errored);
        // the existing file is untouched
        assert_eq!(std::fs::read(h.dir.join("config.bin")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn write_netascii_translates_line_endings() {
        let h = harness("write-netascii").await;
        let mut t = h.transfer(
            "notes.txt",
            TransferDirection::Write,
            TransferMode::Netascii,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_ack(0).await;

        t.on_packet(Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"a\r\nb\r\n"),
        })
        .await;
        h.expect_ack(1).await;
        assert_eq!(t.state(), TransferState::Completed);

        assert_eq!(std::fs::read(h.dir.join("notes.txt")).unwrap(), b"a\nb\n");
    }

    #[tokio::test]
    async fn oversized_data_payload_is_an_illegal_operation() {
        let h = harness("write-oversize").await;
        let mut t = h.transfer(
            "o.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_ack(0).await;

        t.on_packet(Packet::Data {
            block: 1,
            payload: Bytes::from(vec![0u8; 600]),
        })
        .await;
        h.expect_error(ErrorCode::IllegalOperation).await;
        assert_eq!(t.state(), TransferState::Errored);
    }

    #[tokio::test]
    async fn write_stall_resends_ack_then_times_out() {
        let h = harness("write-stall").await;
        let mut t = h.transfer(
            "s.bin",
            TransferDirection::Write,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_ack(0).await;

        let base = Instant::now();
        for retry in 1..=3u32 {
            t.on_tick(base + Duration::from_millis(1100 * u64::from(retry))).await;
            h.expect_ack(0).await;
            assert_eq!(t.state(), TransferState::Transferring, "retry {}", retry);
        }

        t.on_tick(base + Duration::from_millis(4500)).await;
        h.expect_error(ErrorCode::NotDefined).await;
        assert_eq!(t.state(), TransferState::Errored);
    }

    #[tokio::test]
    async fn close_releases_without_wire_traffic() {
        let h = harness("close").await;
        write_file(&h.dir, "c.bin", &[4u8; 32]);

        let mut t = h.transfer(
            "c.bin",
            TransferDirection::Read,
            TransferMode::Octet,
            RequestOptions::default(),
            limits(),
        );
        t.start(&RequestOptions::default()).await;
        h.expect_data(1).await;

        t.close().await;
        assert_eq!(t.state(), TransferState::Closed);
        assert!(t.is_terminal());
        h.expect_silence().await;
    }
}
