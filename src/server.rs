//! UDP dispatcher.
//!
//! One listening socket, one event loop. Inbound datagrams are keyed by the
//! peer (address, port) pair; RRQ/WRQ spawn a [`Transfer`], everything else
//! routes to the owning transfer or draws a stateless unknown-TID error. A
//! half-second tick drives retransmission and a once-per-second pass reaps
//! finished records.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::{NetworkConfig, ServerConfig};
use crate::error::{Result, TftpError};
use crate::monitor::Monitor;
use crate::packet::{self, Packet};
use crate::policy::{AccessPolicy, PolicyViolation};
use crate::transfer::{Transfer, TransferLimits};
use crate::{ErrorCode, MAX_PACKET_SIZE, Opcode, TransferDirection};

/// Capability handed to each transfer: emit datagrams to its peer without
/// exposing the dispatcher.
#[derive(Debug, Clone)]
pub struct SendHandle {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl SendHandle {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, self.peer).await.map(|_| ())
    }
}

/// Requests the server loop to stop accepting and drain.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

pub struct TftpServer {
    config: Arc<ServerConfig>,
    policy: AccessPolicy,
    monitor: Arc<Monitor>,
    socket: Arc<UdpSocket>,
    transfers: HashMap<SocketAddr, Transfer>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TftpServer {
    pub async fn bind(config: Arc<ServerConfig>, monitor: Arc<Monitor>) -> Result<Self> {
        let socket = Arc::new(bind_socket(&config.network)?);
        info!("TFTP server listening on {}", socket.local_addr()?);

        let policy = AccessPolicy::new(&config.filesystem, &config.security);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            policy,
            monitor,
            socket,
            transfers: HashMap::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    /// Serve until a shutdown is requested, then drain transfers.
    pub async fn run(mut self) -> Result<()> {
        let socket = Arc::clone(&self.socket);
        let mut shutdown = self.shutdown_rx.clone();

        // half the minimum negotiable timeout, so a 1s timeout still gets
        // two looks per interval
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reap = tokio::time::interval(Duration::from_secs(1));
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.dispatch(&buf[..len], peer).await,
                    Err(e) => warn!(error = %e, "error receiving datagram"),
                },
                _ = tick.tick() => self.tick_transfers().await,
                _ = reap.tick() => self.reap().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn dispatch(&mut self, datagram: &[u8], peer: SocketAddr) {
        if !self.policy.peer_allowed(peer.ip()) {
            debug!(%peer, "dropped datagram from disallowed peer");
            return;
        }

        if datagram.len() < 2 {
            self.send_error(peer, ErrorCode::IllegalOperation, "Malformed packet")
                .await;
            return;
        }

        let opcode = u16::from_be_bytes([datagram[0], datagram[1]]);
        match Opcode::try_from(opcode) {
            Ok(Opcode::Rrq) | Ok(Opcode::Wrq) => self.handle_request(datagram, peer).await,
            Ok(_) => self.route(datagram, peer).await,
            Err(_) => {
                debug!(%peer, opcode, "invalid opcode");
                self.send_error(peer, ErrorCode::IllegalOperation, "Illegal TFTP operation")
                    .await;
            }
        }
    }

    async fn handle_request(&mut self, datagram: &[u8], peer: SocketAddr) {
        // a finished record on this TID no longer claims it
        if self.transfers.get(&peer).is_some_and(|t| t.is_terminal()) {
            self.transfers.remove(&peer);
        }
        if self.transfers.contains_key(&peer) {
            warn!(%peer, "request on a TID with a live transfer");
            self.send_error(
                peer,
                ErrorCode::UnknownTransferId,
                "Transfer already in progress",
            )
            .await;
            return;
        }

        let request_packet = match packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                debug!(%peer, error = %e, "request parse failed");
                self.monitor.record_connection(false);
                self.send_error(peer, ErrorCode::IllegalOperation, "Malformed request")
                    .await;
                return;
            }
        };
        let (request, direction) = match request_packet {
            Packet::Rrq(request) => (request, TransferDirection::Read),
            Packet::Wrq(request) => (request, TransferDirection::Write),
            _ => return,
        };

        debug!(
            %peer,
            filename = %request.filename,
            mode = request.mode.as_str(),
            direction = direction.as_str(),
            "request received"
        );

        let audit_enabled = self.config.logging.audit_enabled;
        if audit_enabled {
            let options = serde_json::json!({
                "blksize": request.options.blksize,
                "timeout": request.options.timeout,
                "tsize": request.options.tsize,
                "windowsize": request.options.windowsize,
            });
            match direction {
                TransferDirection::Read => {
                    AuditLogger::read_request(peer, &request.filename, request.mode.as_str(), options)
                }
                TransferDirection::Write => {
                    AuditLogger::write_request(peer, &request.filename, request.mode.as_str(), options)
                }
            }
        }

        let path = match self.policy.authorize(&request.filename, peer.ip(), direction) {
            Ok(path) => path,
            Err(violation) => {
                warn!(%peer, filename = %request.filename, %violation, "request denied");
                if audit_enabled {
                    if violation == PolicyViolation::Traversal {
                        AuditLogger::path_traversal_attempt(peer, &request.filename);
                    } else {
                        AuditLogger::request_denied(
                            peer,
                            &request.filename,
                            direction.as_str(),
                            &violation.to_string(),
                        );
                    }
                }
                self.monitor.record_connection(false);
                self.send_error(peer, violation.wire_code(), &violation.to_string())
                    .await;
                return;
            }
        };

        let limits = TransferLimits {
            block_size_ceiling: self.config.performance.block_size as usize,
            window_size_ceiling: self.config.performance.window_size as usize,
            default_timeout: Duration::from_secs(self.config.performance.timeout_secs),
            max_retries: self.config.performance.max_retries,
            max_file_size: self.config.security.max_file_size,
            overwrite_protection: self.config.security.overwrite_protection,
        };
        let send = SendHandle::new(Arc::clone(&self.socket), peer);
        let mut transfer = Transfer::new(
            peer,
            &request,
            direction,
            path,
            limits,
            send,
            Arc::clone(&self.monitor),
            audit_enabled,
        );
        transfer.start(&request.options).await;

        if transfer.is_terminal() {
            // the engine already sent its one ERROR and recorded metrics
            self.monitor.record_connection(false);
            return;
        }

        self.monitor.record_connection(true);
        self.transfers.insert(peer, transfer);
        self.monitor.update_active(self.transfers.len());
    }

    async fn route(&mut self, datagram: &[u8], peer: SocketAddr) {
        let packet = match packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                debug!(%peer, error = %e, "packet parse failed");
                self.send_error(peer, ErrorCode::IllegalOperation, "Malformed packet")
                    .await;
                return;
            }
        };

        let routed = if let Some(transfer) = self.transfers.get_mut(&peer) {
            transfer.on_packet(packet).await;
            true
        } else {
            false
        };
        if !routed {
            debug!(%peer, "datagram for unknown TID");
            self.send_error(peer, ErrorCode::UnknownTransferId, "Unknown transfer ID")
                .await;
        }
    }

    async fn tick_transfers(&mut self) {
        let now = Instant::now();
        for transfer in self.transfers.values_mut() {
            transfer.on_tick(now).await;
        }
    }

    async fn reap(&mut self) {
        let now = Instant::now();
        let stale: Vec<SocketAddr> = self
            .transfers
            .iter()
            .filter(|(_, t)| t.is_terminal() || t.idle_expired(now))
            .map(|(peer, _)| *peer)
            .collect();
        if stale.is_empty() {
            return;
        }

        for peer in stale {
            if let Some(mut transfer) = self.transfers.remove(&peer) {
                if transfer.is_terminal() {
                    debug!(%peer, state = ?transfer.state(), "reaped finished transfer");
                } else {
                    // backstop; the engine's own idle cutoff fires first
                    warn!(%peer, "reaped stale transfer");
                    transfer.close().await;
                }
            }
        }
        self.monitor.update_active(self.transfers.len());
    }

    async fn shutdown(&mut self) {
        info!(
            "shutting down; closing {} active transfer(s)",
            self.transfers.len()
        );
        for (_, mut transfer) in self.transfers.drain() {
            transfer.close().await;
        }
        self.monitor.update_active(0);
        if self.config.logging.audit_enabled {
            AuditLogger::server_shutdown("shutdown requested");
        }
    }

    /// Stateless best-effort ERROR datagram; no transfer state changes.
    async fn send_error(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        let bytes = packet::encode(&Packet::Error {
            code,
            message: message.to_string(),
        });
        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            debug!(%peer, error = %e, "failed to send error datagram");
        }
    }
}

/// Attempt an IPv6 bind when enabled, falling back to IPv4.
fn bind_socket(network: &NetworkConfig) -> Result<UdpSocket> {
    if network.ipv6_enabled {
        let v6 = match network.listen_address {
            IpAddr::V6(addr) => addr,
            IpAddr::V4(addr) if addr.is_unspecified() => Ipv6Addr::UNSPECIFIED,
            IpAddr::V4(addr) => addr.to_ipv6_mapped(),
        };
        match open_socket(SocketAddr::new(IpAddr::V6(v6), network.listen_port)) {
            Ok(socket) => return Ok(socket),
            Err(e) => warn!("IPv6 bind failed ({}), falling back to IPv4", e),
        }
    }

    let v4 = match network.listen_address {
        IpAddr::V4(addr) => IpAddr::V4(addr),
        IpAddr::V6(addr) if addr.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(addr) => IpAddr::V6(addr),
    };
    open_socket(SocketAddr::new(v4, network.listen_port))
}

fn open_socket(bind_addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Config(format!("failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TftpError::Config(format!("failed to set SO_REUSEADDR: {}", e)))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|e| TftpError::Config(format!("failed to bind to {}: {}", bind_addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TftpError::Config(format!("failed to set non-blocking: {}", e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| TftpError::Config(format!("failed to register socket: {}", e)))
}
