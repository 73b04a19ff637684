// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RendezvousAllocator: hands a producer a dedicated private port pair so
//! many producers can share the relay without port collisions, plus the
//! SplitterSlot control channel each allocation lives inside.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{info, warn};

use super::connection::{ConnectionError, LineConnection};
use super::paired::PairedPipe;
use super::protocol::{ProtocolError, RendezvousCommand, SplitterMessage};

/// A single producer's rendezvous session: its assigned control port plus,
/// once `ready` is received, its data ports.
pub struct SplitterSlot {
    pub node_id: String,
    pub peer_ip: IpAddr,
    pub control_port: u16,
    pub detector_port: Option<u16>,
    pub display_port: Option<u16>,
    pub last_seen: Instant,
    pub has_sdr: bool,
}

impl SplitterSlot {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_expired(&self, lease_duration: Duration) -> bool {
        self.last_seen.elapsed() > lease_duration
    }
}

/// Error returned when the rendezvous port pool cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrPoolFull;

impl std::fmt::Display for ErrPoolFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rendezvous port pool exhausted")
    }
}

impl std::error::Error for ErrPoolFull {}

/// Pool of reserved ports handed out to producers, plus the set of
/// SplitterSlots those ports currently back.
pub struct RendezvousAllocator {
    bind_address: IpAddr,
    base: u16,
    max: u16,
    cursor: Mutex<u16>,
    bound_ports: Mutex<HashSet<u16>>,
    slots: RwLock<Vec<SplitterSlot>>,
    max_slots: usize,
}

impl RendezvousAllocator {
    pub fn new(bind_address: IpAddr, base: u16, max: u16, max_slots: usize) -> Self {
        Self {
            bind_address,
            base,
            max,
            cursor: Mutex::new(base),
            bound_ports: Mutex::new(HashSet::new()),
            slots: RwLock::new(Vec::new()),
            max_slots,
        }
    }

    /// Reserve the next free port number in [base, max], wrapping the
    /// cursor. Fails only if every port in the range is already reserved.
    async fn reserve_port(&self) -> Result<u16, ErrPoolFull> {
        let mut cursor = self.cursor.lock().await;
        let mut bound = self.bound_ports.lock().await;
        let span = (self.max - self.base + 1) as usize;

        for _ in 0..span {
            let port = *cursor;
            *cursor = if port >= self.max { self.base } else { port + 1 };
            if !bound.contains(&port) {
                bound.insert(port);
                return Ok(port);
            }
        }
        Err(ErrPoolFull)
    }

    async fn release_port(&self, port: u16) {
        self.bound_ports.lock().await.remove(&port);
    }

    /// Reserve a port and actually bind it. Bind failure is treated as
    /// advisory per spec: the reservation is released and the next
    /// candidate port is tried until the pool is exhausted.
    async fn reserve_and_bind(&self) -> Result<(u16, TcpListener), ErrPoolFull> {
        let span = (self.max - self.base + 1) as usize;
        for _ in 0..span {
            let port = self.reserve_port().await?;
            match TcpListener::bind((self.bind_address, port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => {
                    warn!(port, error = %e, "rendezvous bind failed, advancing cursor");
                    self.release_port(port).await;
                }
            }
        }
        Err(ErrPoolFull)
    }

    /// Handle one rendezvous hello: reserve and bind a control port,
    /// register a fresh SplitterSlot, and return the listener to drive.
    pub async fn handle_hello(
        &self,
        node_id: String,
        peer_ip: IpAddr,
    ) -> Result<(u16, TcpListener), ErrPoolFull> {
        let (port, listener) = self.reserve_and_bind().await?;

        let mut slots = self.slots.write().await;
        if slots.len() >= self.max_slots {
            drop(slots);
            self.release_port(port).await;
            return Err(ErrPoolFull);
        }
        slots.push(SplitterSlot {
            node_id,
            peer_ip,
            control_port: port,
            detector_port: None,
            display_port: None,
            last_seen: Instant::now(),
            has_sdr: false,
        });

        Ok((port, listener))
    }

    /// Handle a producer's `ready` on its assigned control port: reserve
    /// and bind two more ports, recording them against the matching slot.
    pub async fn handle_ready(
        &self,
        control_port: u16,
        has_sdr: bool,
    ) -> Result<((u16, TcpListener), (u16, TcpListener)), ErrPoolFull> {
        let (det, det_listener) = self.reserve_and_bind().await?;
        let (disp, disp_listener) = match self.reserve_and_bind().await {
            Ok(v) => v,
            Err(e) => {
                self.release_port(det).await;
                return Err(e);
            }
        };

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.control_port == control_port) {
            slot.detector_port = Some(det);
            slot.display_port = Some(disp);
            slot.has_sdr = has_sdr;
            slot.touch();
        }

        Ok(((det, det_listener), (disp, disp_listener)))
    }

    pub async fn touch(&self, control_port: u16) {
        if let Some(slot) = self
            .slots
            .write()
            .await
            .iter_mut()
            .find(|s| s.control_port == control_port)
        {
            slot.touch();
        }
    }

    pub async fn remove_slot(&self, control_port: u16) {
        let mut slots = self.slots.write().await;
        if let Some(pos) = slots.iter().position(|s| s.control_port == control_port) {
            let slot = slots.remove(pos);
            drop(slots);
            self.release_port(slot.control_port).await;
            if let Some(p) = slot.detector_port {
                self.release_port(p).await;
            }
            if let Some(p) = slot.display_port {
                self.release_port(p).await;
            }
        }
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Sweep and remove slots idle past `lease_duration`.
    pub async fn remove_expired(&self, lease_duration: Duration) -> Vec<u16> {
        let expired: Vec<u16> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|s| s.is_expired(lease_duration))
            .map(|s| s.control_port)
            .collect();

        for port in &expired {
            self.remove_slot(*port).await;
        }
        expired
    }
}

/// Handshake entry point: accept one connection on the public rendezvous
/// port, expect a single `hello`, reply with an `assign`, bind the
/// assigned control port, and hand the listener to `spawn_control`.
pub async fn handle_rendezvous_connection(
    allocator: Arc<RendezvousAllocator>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_message_size: usize,
    hello_timeout: Duration,
    shutdown: Arc<Notify>,
) {
    let mut conn = LineConnection::new(stream, peer_addr, max_message_size);

    let msg: Option<SplitterMessage> = match tokio::time::timeout(hello_timeout, conn.read_line()).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            warn!(%peer_addr, error = %e, "rendezvous read error");
            return;
        }
        Err(_) => {
            warn!(%peer_addr, "rendezvous hello timed out");
            return;
        }
    };

    let node_id = match msg {
        Some(SplitterMessage::Rendezvous(RendezvousCommand::Hello { id })) => id,
        _ => {
            warn!(%peer_addr, "rendezvous connection did not send hello");
            return;
        }
    };

    match allocator.handle_hello(node_id.clone(), peer_addr.ip()).await {
        Ok((port, listener)) => {
            info!(%peer_addr, node_id = %node_id, port, "rendezvous assigned port");
            let reply = SplitterMessage::Rendezvous(RendezvousCommand::Assign { p: port });
            if conn.write_line(&reply).await.is_ok() {
                tokio::spawn(run_control_channel(
                    allocator,
                    port,
                    listener,
                    max_message_size,
                    shutdown,
                ));
            } else {
                allocator.remove_slot(port).await;
            }
        }
        Err(e) => warn!(%peer_addr, node_id = %node_id, error = %e, "rendezvous allocation failed"),
    }
}

/// Drive one SplitterSlot's control channel for its lifetime. The producer
/// reconnects here first; a second peer (a remote client interested in
/// the splitter's opaque control traffic) may connect afterward. `ready`
/// triggers two-port data allocation; `s` frames relay verbatim between
/// producer and client.
async fn run_control_channel(
    allocator: Arc<RendezvousAllocator>,
    control_port: u16,
    listener: TcpListener,
    max_message_size: usize,
    shutdown: Arc<Notify>,
) {
    let (producer_stream, producer_addr) = tokio::select! {
        result = listener.accept() => match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(control_port, error = %e, "producer reconnect failed");
                allocator.remove_slot(control_port).await;
                return;
            }
        },
        _ = shutdown.notified() => return,
    };
    let mut producer = LineConnection::new(producer_stream, producer_addr, max_message_size);

    let (to_producer_tx, mut to_producer_rx) = mpsc::channel::<String>(32);
    let (to_client_tx, to_client_rx) = mpsc::channel::<String>(32);

    tokio::spawn(accept_control_client(
        listener,
        max_message_size,
        to_producer_tx,
        to_client_rx,
        Arc::clone(&shutdown),
    ));

    loop {
        tokio::select! {
            result = producer.read_line::<SplitterMessage>() => {
                match result {
                    Ok(Some(msg)) => {
                        allocator.touch(control_port).await;
                        match msg {
                            SplitterMessage::Rendezvous(RendezvousCommand::Ready { has_sdr }) => {
                                match allocator.handle_ready(control_port, has_sdr).await {
                                    Ok(((det, det_listener), (disp, disp_listener))) => {
                                        let reply = SplitterMessage::Rendezvous(RendezvousCommand::Ports { det, disp });
                                        if producer.write_line(&reply).await.is_err() {
                                            break;
                                        }
                                        spawn_data_pipe(det_listener, "detector", Arc::clone(&shutdown));
                                        spawn_data_pipe(disp_listener, "display", shutdown.clone());
                                    }
                                    Err(e) => warn!(control_port, error = %e, "ready handling failed"),
                                }
                            }
                            SplitterMessage::Rendezvous(RendezvousCommand::Pong) => {}
                            SplitterMessage::Data { d } => {
                                let _ = to_client_tx.send(d).await;
                            }
                            SplitterMessage::Rendezvous(other) => {
                                warn!(control_port, command = ?other, "unexpected command from producer");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(ConnectionError::Protocol(e)) => {
                        warn!(control_port, error = %e, "producer protocol error, dropping line");
                    }
                    Err(e) => {
                        warn!(control_port, error = %e, "producer control read error");
                        break;
                    }
                }
            }
            Some(d) = to_producer_rx.recv() => {
                let frame = SplitterMessage::Data { d };
                if producer.write_line(&frame).await.is_err() {
                    break;
                }
            }
            _ = shutdown.notified() => break,
        }
    }

    allocator.remove_slot(control_port).await;
}

/// Accept the control port's second peer (the client side of the opaque
/// payload relay) and forward `s` frames between it and the producer task
/// via the two channels set up by `run_control_channel`.
async fn accept_control_client(
    listener: TcpListener,
    max_message_size: usize,
    to_producer_tx: mpsc::Sender<String>,
    mut to_client_rx: mpsc::Receiver<String>,
    shutdown: Arc<Notify>,
) {
    let (stream, peer_addr) = tokio::select! {
        result = listener.accept() => match result {
            Ok(pair) => pair,
            Err(_) => return,
        },
        _ = shutdown.notified() => return,
    };
    let mut client = LineConnection::new(stream, peer_addr, max_message_size);

    loop {
        tokio::select! {
            result = client.read_line::<SplitterMessage>() => {
                match result {
                    Ok(Some(SplitterMessage::Data { d })) => {
                        if to_producer_tx.send(d).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(ConnectionError::Protocol(e)) => {
                        warn!(%peer_addr, error = %e, "control client protocol error, dropping line");
                    }
                    Err(_) => break,
                }
            }
            Some(d) = to_client_rx.recv() => {
                let frame = SplitterMessage::Data { d };
                if client.write_line(&frame).await.is_err() {
                    break;
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

/// Drive a detector/display data port as a raw-byte PairedPipe, reusing
/// the same bridge the control/dumb-pipe ports use.
fn spawn_data_pipe(listener: TcpListener, name: &'static str, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let pipe = Arc::new(PairedPipe::new(name));
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(Arc::clone(&pipe).run_peer(stream, peer_addr, Arc::clone(&shutdown)));
                        }
                        Err(_) => break,
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    });
}

impl From<ErrPoolFull> for ProtocolError {
    fn from(_: ErrPoolFull) -> Self {
        ProtocolError::InvalidPayload("rendezvous pool exhausted".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_reserve_port_within_range() {
        let allocator = RendezvousAllocator::new(localhost(), 3001, 3100, 32);
        let port = allocator.reserve_port().await.unwrap();
        assert!((3001..=3100).contains(&port));
    }

    #[tokio::test]
    async fn test_reserve_port_skips_bound() {
        let allocator = RendezvousAllocator::new(localhost(), 3001, 3002, 32);
        let a = allocator.reserve_port().await.unwrap();
        let b = allocator.reserve_port().await.unwrap();
        assert_ne!(a, b);
        assert!(allocator.reserve_port().await.is_err());
    }

    #[tokio::test]
    async fn test_handle_hello_assigns_distinct_ports() {
        let allocator = RendezvousAllocator::new(localhost(), 0, 0, 32);
        // base==max==0 lets the OS pick an ephemeral port per bind, so
        // distinctness comes from the OS rather than the cursor here.
        let allocator = Arc::new(allocator);
        let (p1, _l1) = allocator.handle_hello("SPL-1".into(), localhost()).await.unwrap();
        let (p2, _l2) = allocator.handle_hello("SPL-1".into(), localhost()).await.unwrap();

        assert_ne!(p1, p2);
        assert_eq!(allocator.slot_count().await, 2);
    }

    #[tokio::test]
    async fn test_handle_ready_allocates_two_data_ports() {
        let allocator = RendezvousAllocator::new(localhost(), 0, 0, 32);
        let (control, _listener) = allocator.handle_hello("SPL-1".into(), localhost()).await.unwrap();

        let ((det, _), (disp, _)) = allocator.handle_ready(control, true).await.unwrap();
        assert_ne!(det, disp);
    }

    #[tokio::test]
    async fn test_remove_slot_releases_ports() {
        let allocator = RendezvousAllocator::new(localhost(), 0, 0, 32);
        let (control, _listener) = allocator.handle_hello("SPL-1".into(), localhost()).await.unwrap();
        allocator.handle_ready(control, false).await.unwrap();

        allocator.remove_slot(control).await;

        assert_eq!(allocator.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_expired_slots() {
        let allocator = RendezvousAllocator::new(localhost(), 0, 0, 32);
        let (control, _listener) = allocator.handle_hello("SPL-1".into(), localhost()).await.unwrap();

        {
            let mut slots = allocator.slots.write().await;
            slots[0].last_seen = Instant::now() - Duration::from_secs(200);
        }

        let expired = allocator.remove_expired(Duration::from_secs(120)).await;
        assert_eq!(expired, vec![control]);
        assert_eq!(allocator.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_hello_assign_ready_ports_end_to_end() {
        let allocator = Arc::new(RendezvousAllocator::new(localhost(), 0, 0, 32));
        let rendezvous_listener = TcpListener::bind((localhost(), 0)).await.unwrap();
        let rendezvous_addr = rendezvous_listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());

        let allocator2 = Arc::clone(&allocator);
        let shutdown2 = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let (stream, peer_addr) = rendezvous_listener.accept().await.unwrap();
            handle_rendezvous_connection(allocator2, stream, peer_addr, 4096, Duration::from_secs(5), shutdown2).await;
        });

        let mut producer = TcpStream::connect(rendezvous_addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        producer.write_all(b"{\"t\":\"r\",\"c\":\"hello\",\"id\":\"SPL-1\"}\n").await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = producer.read(&mut buf).await.unwrap();
        let assign: serde_json::Value = serde_json::from_slice(&buf[..n - 1]).unwrap();
        assert_eq!(assign["c"], "assign");
        let control_port = assign["p"].as_u64().unwrap() as u16;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut control = TcpStream::connect((localhost(), control_port)).await.unwrap();
        control
            .write_all(b"{\"t\":\"r\",\"c\":\"ready\",\"has_sdr\":\"true\"}\n")
            .await
            .unwrap();

        let n = control.read(&mut buf).await.unwrap();
        let ports: serde_json::Value = serde_json::from_slice(&buf[..n - 1]).unwrap();
        assert_eq!(ports["c"], "ports");
        assert_ne!(ports["det"], ports["disp"]);
    }
}
