// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PairedPipe: bidirectional byte bridge between exactly two peers on one
//! listen port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

const FORWARD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

/// Two-slot bidirectional bridge. A third accept is rejected outright.
/// Each slot's write half is held independently so one side erroring out
/// doesn't tear down the other — the remaining peer is retained, matching
/// the original "partner survives until it too errors" contract.
pub struct PairedPipe {
    name: String,
    write_a: Mutex<Option<WriteHalf<TcpStream>>>,
    write_b: Mutex<Option<WriteHalf<TcpStream>>>,
    bytes_a_to_b: AtomicU64,
    bytes_b_to_a: AtomicU64,
}

impl PairedPipe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            write_a: Mutex::new(None),
            write_b: Mutex::new(None),
            bytes_a_to_b: AtomicU64::new(0),
            bytes_b_to_a: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_a_to_b(&self) -> u64 {
        self.bytes_a_to_b.load(Ordering::Relaxed)
    }

    pub fn bytes_b_to_a(&self) -> u64 {
        self.bytes_b_to_a.load(Ordering::Relaxed)
    }

    /// Claim slot A if free, else slot B if free, else `None` (caller
    /// closes the socket immediately).
    async fn claim_slot(&self) -> Option<Slot> {
        let mut a = self.write_a.lock().await;
        if a.is_none() {
            return Some(Slot::A);
        }
        drop(a);
        let b = self.write_b.lock().await;
        if b.is_none() {
            return Some(Slot::B);
        }
        None
    }

    /// Drive one accepted peer for the life of its connection: claim a
    /// slot, forward every byte it sends to whichever peer currently
    /// occupies the other slot, and release the slot on EOF or error.
    pub async fn run_peer(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, shutdown: Arc<Notify>) {
        let slot = match self.claim_slot().await {
            Some(slot) => slot,
            None => {
                warn!(pipe = %self.name, %peer_addr, "pair already full, rejecting");
                let mut stream = stream;
                let _ = stream.shutdown().await;
                return;
            }
        };

        let (mut read_half, write_half) = split(stream);
        match slot {
            Slot::A => *self.write_a.lock().await = Some(write_half),
            Slot::B => *self.write_b.lock().await = Some(write_half),
        }
        info!(pipe = %self.name, %peer_addr, slot = ?slot, "peer attached");

        let mut buf = vec![0u8; FORWARD_CHUNK];
        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => self.forward(slot, &buf[..n]).await,
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        match slot {
            Slot::A => *self.write_a.lock().await = None,
            Slot::B => *self.write_b.lock().await = None,
        }
        info!(pipe = %self.name, %peer_addr, slot = ?slot, "peer detached");
    }

    async fn forward(&self, from: Slot, bytes: &[u8]) {
        let (partner, counter) = match from {
            Slot::A => (&self.write_b, &self.bytes_a_to_b),
            Slot::B => (&self.write_a, &self.bytes_b_to_a),
        };

        let mut partner = partner.lock().await;
        if let Some(write_half) = partner.as_mut() {
            if write_half.write_all(bytes).await.is_ok() {
                counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (server, peer) = accept.unwrap();
        (server, connect.unwrap(), peer)
    }

    #[tokio::test]
    async fn test_third_peer_rejected() {
        let pipe = Arc::new(PairedPipe::new("control"));
        let shutdown = Arc::new(Notify::new());

        let (sock_a, _client_a, peer_a) = connected_pair().await;
        let (sock_b, _client_b, peer_b) = connected_pair().await;
        let (sock_c, mut client_c, peer_c) = connected_pair().await;

        tokio::spawn(Arc::clone(&pipe).run_peer(sock_a, peer_a, Arc::clone(&shutdown)));
        tokio::spawn(Arc::clone(&pipe).run_peer(sock_b, peer_b, Arc::clone(&shutdown)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        pipe.run_peer(sock_c, peer_c, shutdown).await;

        let mut buf = [0u8; 1];
        let n = client_c.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_bridges_both_directions() {
        let pipe = Arc::new(PairedPipe::new("control"));
        let shutdown = Arc::new(Notify::new());

        let (sock_a, mut client_a, peer_a) = connected_pair().await;
        let (sock_b, mut client_b, peer_b) = connected_pair().await;

        tokio::spawn(Arc::clone(&pipe).run_peer(sock_a, peer_a, Arc::clone(&shutdown)));
        tokio::spawn(Arc::clone(&pipe).run_peer(sock_b, peer_b, Arc::clone(&shutdown)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pipe.bytes_a_to_b(), 4);
        assert_eq!(pipe.bytes_b_to_a(), 4);
    }

    #[tokio::test]
    async fn test_partner_survives_peer_disconnect() {
        let pipe = Arc::new(PairedPipe::new("control"));
        let shutdown = Arc::new(Notify::new());

        let (sock_a, client_a, peer_a) = connected_pair().await;
        let (sock_b, mut client_b, peer_b) = connected_pair().await;

        tokio::spawn(Arc::clone(&pipe).run_peer(sock_a, peer_a, Arc::clone(&shutdown)));
        let handle_b = tokio::spawn(Arc::clone(&pipe).run_peer(sock_b, peer_b, shutdown));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(client_a);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(pipe.write_b.lock().await.is_some());
        client_b.write_all(b"x").await.unwrap();

        drop(client_b);
        let _ = handle_b.await;
    }
}
