// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay core: owns every subsystem and drives the accept loops and
//! background tasks that make up the running process.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub mod broadcast;
pub mod connection;
pub mod paired;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod ring_buffer;

use crate::config::{Mode, RelayConfig};
use broadcast::BroadcastPipe;
use connection::LineConnection;
use paired::PairedPipe;
use protocol::{RegistryReply, RegistryRequest, StreamHeader};
use registry::Registry;
use rendezvous::{handle_rendezvous_connection, RendezvousAllocator};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// The top-level relay: one producer-facing broadcast pipe per stream, a
/// paired control bridge, a rendezvous allocator, and a service registry,
/// all wired together the way `DiscoveryServer` wires its own subsystems.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    registry: Arc<tokio::sync::RwLock<Registry>>,
    rendezvous: Arc<RendezvousAllocator>,
    detector_pipe: Arc<BroadcastPipe>,
    display_pipe: Arc<BroadcastPipe>,
    control_pipe: Arc<PairedPipe>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl Relay {
    pub async fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let detector_header = StreamHeader::new(config.detector_sample_rate_hz);
        let display_header = StreamHeader::new(config.display_sample_rate_hz);

        Ok(Self {
            detector_pipe: Arc::new(BroadcastPipe::new(
                "detector",
                detector_header,
                config.ring_buffer_detector_bytes,
                config.max_consumers_per_pipe,
            )),
            display_pipe: Arc::new(BroadcastPipe::new(
                "display",
                display_header,
                config.ring_buffer_display_bytes,
                config.max_consumers_per_pipe,
            )),
            control_pipe: Arc::new(PairedPipe::new("control")),
            rendezvous: Arc::new(RendezvousAllocator::new(
                config.bind_address,
                config.rendezvous_port_base,
                config.rendezvous_port_max,
                config.max_splitter_slots,
            )),
            registry: Arc::new(tokio::sync::RwLock::new(Registry::new(
                config.max_edges,
                config.max_services,
            ))),
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn run(&self) -> Result<(), RelayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        match self.config.mode {
            Mode::Full => self.run_full().await?,
            Mode::DumbPipe => self.run_dumb_pipe().await?,
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_full(&self) -> Result<(), RelayError> {
        let bind = self.config.bind_address;

        let detector_listener = self.bind(bind, self.config.detector_port).await?;
        let display_listener = self.bind(bind, self.config.display_port).await?;
        let control_listener = self.bind(bind, self.config.control_port).await?;
        let rendezvous_listener = self.bind(bind, self.config.rendezvous_port).await?;
        let registry_listener = self.bind(bind, self.config.registry_port).await?;

        self.spawn_status_task();
        self.spawn_sweep_task();
        self.spawn_broadcast_drain_task(Arc::clone(&self.detector_pipe));
        self.spawn_broadcast_drain_task(Arc::clone(&self.display_pipe));

        tokio::join!(
            self.accept_broadcast(detector_listener, Arc::clone(&self.detector_pipe)),
            self.accept_broadcast(display_listener, Arc::clone(&self.display_pipe)),
            self.accept_paired(control_listener, Arc::clone(&self.control_pipe)),
            self.accept_rendezvous(rendezvous_listener),
            self.accept_registry(registry_listener),
        );

        Ok(())
    }

    /// Minimal three-port deployment: no registry, no rendezvous, just the
    /// paired control/detector/display bridges, grounded on the retained
    /// minimal relay revision.
    async fn run_dumb_pipe(&self) -> Result<(), RelayError> {
        let bind = self.config.bind_address;

        let control_listener = self.bind(bind, self.config.dumb_control_port).await?;
        let detector_listener = self.bind(bind, self.config.dumb_detector_port).await?;
        let display_listener = self.bind(bind, self.config.dumb_display_port).await?;

        let detector_pipe = Arc::new(PairedPipe::new("dumb-detector"));
        let display_pipe = Arc::new(PairedPipe::new("dumb-display"));

        self.spawn_status_task();

        tokio::join!(
            self.accept_paired(control_listener, Arc::clone(&self.control_pipe)),
            self.accept_paired(detector_listener, detector_pipe),
            self.accept_paired(display_listener, display_pipe),
        );

        Ok(())
    }

    async fn bind(&self, addr: std::net::IpAddr, port: u16) -> Result<TcpListener, RelayError> {
        let socket_addr = SocketAddr::new(addr, port);
        let listener = TcpListener::bind(socket_addr)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {}", socket_addr, e)))?;
        info!(%socket_addr, "listening");
        Ok(listener)
    }

    async fn accept_broadcast(&self, listener: TcpListener, pipe: Arc<BroadcastPipe>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(pipe = pipe.name(), %peer_addr, "accepted broadcast connection");
                            let pipe = Arc::clone(&pipe);
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(async move {
                                if pipe.has_producer().await {
                                    pipe.on_consumer_accept(stream, peer_addr).await;
                                } else {
                                    pipe.run_producer(stream, shutdown).await;
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "broadcast accept error"),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn accept_paired(&self, listener: TcpListener, pipe: Arc<PairedPipe>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let pipe = Arc::clone(&pipe);
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(pipe.run_peer(stream, peer_addr, shutdown));
                        }
                        Err(e) => error!(error = %e, "paired accept error"),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn accept_rendezvous(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let allocator = Arc::clone(&self.rendezvous);
                            let max_message_size = self.config.max_message_size;
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(async move {
                                handle_rendezvous_connection(allocator, stream, peer_addr, max_message_size, HELLO_TIMEOUT, shutdown).await;
                            });
                        }
                        Err(e) => error!(error = %e, "rendezvous accept error"),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn accept_registry(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let max_message_size = self.config.max_message_size;
                            tokio::spawn(Self::handle_registry_connection(registry, stream, peer_addr, max_message_size));
                        }
                        Err(e) => error!(error = %e, "registry accept error"),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn handle_registry_connection(
        registry: Arc<tokio::sync::RwLock<Registry>>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        max_message_size: usize,
    ) {
        let mut conn = LineConnection::new(stream, peer_addr, max_message_size);
        let edge_id = match registry
            .write()
            .await
            .add_edge(peer_addr.to_string(), peer_addr.ip())
        {
            Some(id) => id,
            None => {
                warn!(%peer_addr, "edge cap reached, rejecting");
                let _ = conn.shutdown().await;
                return;
            }
        };

        loop {
            let request: Option<RegistryRequest> = match conn.read_line().await {
                Ok(req) => req,
                Err(connection::ConnectionError::Protocol(e)) => {
                    warn!(%peer_addr, error = %e, "registry protocol error, dropping line");
                    continue;
                }
                Err(e) => {
                    warn!(%peer_addr, error = %e, "registry read error");
                    break;
                }
            };

            let Some(request) = request else { break };

            let mut reg = registry.write().await;
            reg.touch_edge(edge_id);
            match request {
                RegistryRequest::Helo {
                    id,
                    svc,
                    port,
                    data,
                    caps,
                } => {
                    if reg.advertise(edge_id, id, svc, port, data, caps).is_none() {
                        warn!(%peer_addr, "service cap reached, rejecting");
                        drop(reg);
                        let _ = conn.shutdown().await;
                        break;
                    }
                }
                RegistryRequest::Bye { id: _, svc } => {
                    reg.withdraw(edge_id, svc.as_deref());
                }
                RegistryRequest::List => {
                    let reply = RegistryReply::list(reg.list());
                    drop(reg);
                    let _ = conn.write_line(&reply).await;
                    continue;
                }
                RegistryRequest::Find { svc } => {
                    let reply = RegistryReply::list(reg.find(&svc));
                    drop(reg);
                    let _ = conn.write_line(&reply).await;
                    continue;
                }
            }
        }

        registry.write().await.remove_edge(edge_id);
        info!(%peer_addr, "edge disconnected");
    }

    fn spawn_status_task(&self) {
        let interval = self.config.heartbeat_interval();
        let shutdown = Arc::clone(&self.shutdown);
        let detector_pipe = Arc::clone(&self.detector_pipe);
        let display_pipe = Arc::clone(&self.display_pipe);
        let registry = Arc::clone(&self.registry);
        let rendezvous = Arc::clone(&self.rendezvous);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reg = registry.read().await;
                        info!(
                            detector_consumers = detector_pipe.consumer_count().await,
                            detector_bytes = detector_pipe.bytes_relayed(),
                            display_consumers = display_pipe.consumer_count().await,
                            display_bytes = display_pipe.bytes_relayed(),
                            edges = reg.edge_count(),
                            services = reg.service_count(),
                            splitter_slots = rendezvous.slot_count().await,
                            "status",
                        );
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_sweep_task(&self) {
        let interval = self.config.heartbeat_interval();
        let lease_duration = self.config.lease_duration();
        let shutdown = Arc::clone(&self.shutdown);
        let registry = Arc::clone(&self.registry);
        let rendezvous = Arc::clone(&self.rendezvous);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired_edges = registry.write().await.remove_expired(lease_duration);
                        if !expired_edges.is_empty() {
                            info!(count = expired_edges.len(), "removed expired edges");
                        }
                        let expired_slots = rendezvous.remove_expired(lease_duration).await;
                        if !expired_slots.is_empty() {
                            info!(count = expired_slots.len(), "removed expired splitter slots");
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_broadcast_drain_task(&self, pipe: Arc<BroadcastPipe>) {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = ticker.tick() => pipe.drain().await,
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn edge_count(&self) -> usize {
        self.registry.read().await.edge_count()
    }
}

/// Top-level relay error types.
#[derive(Debug)]
pub enum RelayError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Bind(s) => write!(f, "bind error: {}", s),
            Self::AlreadyRunning => write!(f, "relay already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<connection::ConnectionError> for RelayError {
    fn from(e: connection::ConnectionError) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            detector_port: 0,
            display_port: 0,
            control_port: 0,
            rendezvous_port: 0,
            registry_port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_relay_new_validates_config() {
        let mut config = test_config();
        config.max_edges = 0;
        assert!(Relay::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_starts_not_running() {
        let relay = Relay::new(test_config()).await.unwrap();
        assert!(!relay.is_running());
    }

    #[tokio::test]
    async fn test_registry_round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(tokio::sync::RwLock::new(Registry::new(32, 128)));

        let registry2 = Arc::clone(&registry);
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            Relay::handle_registry_connection(registry2, stream, peer_addr, 4096).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client
            .write_all(b"{\"cmd\":\"helo\",\"id\":\"KY4OLB-SDR1\",\"svc\":\"sdr_server\",\"port\":4535,\"data\":4536,\"caps\":\"rsp1a\"}\n")
            .await
            .unwrap();
        client.write_all(b"{\"cmd\":\"find\",\"svc\":\"sdr_server\"}\n").await.unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"svc\":\"sdr_server\""));
        assert!(text.contains("\"port\":4535"));
        assert!(text.contains("\"id\":\"KY4OLB-SDR1\""));
    }

    #[tokio::test]
    async fn test_registry_malformed_line_does_not_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(tokio::sync::RwLock::new(Registry::new(32, 128)));

        let registry2 = Arc::clone(&registry);
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            Relay::handle_registry_connection(registry2, stream, peer_addr, 4096).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"not valid json\n").await.unwrap();
        client.write_all(b"{\"cmd\":\"list\"}\n").await.unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"cmd\":\"list\""));
    }
}
