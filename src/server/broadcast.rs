// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BroadcastPipe: one producer, many consumers, per-consumer ring buffers
//! with overwrite-on-full semantics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::protocol::StreamHeader;
use super::ring_buffer::RingBuffer;

const PRODUCER_READ_CHUNK: usize = 64 * 1024;
const CONSUMER_DRAIN_CHUNK: usize = 8 * 1024;

/// A single accepted downstream peer of a BroadcastPipe.
struct Consumer {
    stream: TcpStream,
    peer_addr: SocketAddr,
    ring: RingBuffer,
    header_bytes_sent: usize,
    #[allow(dead_code)]
    connected_at: Instant,
    frames_sent: u64,
}

/// Aggregate counters for a BroadcastPipe, exposed for the status report.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub bytes_relayed: AtomicU64,
    pub consumers_ever_served: AtomicU64,
}

/// One producer slot fanned out to up to `max_consumers` ring-buffered
/// consumer slots.
pub struct BroadcastPipe {
    name: String,
    header: StreamHeader,
    consumer_ring_capacity: usize,
    max_consumers: usize,
    consumers: RwLock<Vec<Consumer>>,
    producer_present: RwLock<bool>,
    stats: BroadcastStats,
}

impl BroadcastPipe {
    pub fn new(name: impl Into<String>, header: StreamHeader, consumer_ring_capacity: usize, max_consumers: usize) -> Self {
        Self {
            name: name.into(),
            header,
            consumer_ring_capacity,
            max_consumers,
            consumers: RwLock::new(Vec::new()),
            producer_present: RwLock::new(false),
            stats: BroadcastStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Whether a producer is currently attached. The accept loop uses this
    /// to decide whether a fresh connection on the pipe's port is the one
    /// producer or another consumer: the first connection after the pipe
    /// goes producer-less claims the producer role, exactly the ordering
    /// convention the dumb-pipe relay uses for its two-slot pairs.
    pub async fn has_producer(&self) -> bool {
        *self.producer_present.read().await
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.stats.bytes_relayed.load(Ordering::Relaxed)
    }

    /// Accept a new consumer socket, rejecting it if the pipe is at capacity.
    pub async fn on_consumer_accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let mut consumers = self.consumers.write().await;
        if consumers.len() >= self.max_consumers {
            warn!(pipe = %self.name, %peer_addr, "consumer cap reached, rejecting");
            drop(consumers);
            let mut stream = stream;
            let _ = stream.shutdown().await;
            return;
        }

        consumers.push(Consumer {
            stream,
            peer_addr,
            ring: RingBuffer::new(self.consumer_ring_capacity),
            header_bytes_sent: 0,
            connected_at: Instant::now(),
            frames_sent: 0,
        });
        self.stats.consumers_ever_served.fetch_add(1, Ordering::Relaxed);
        info!(pipe = %self.name, %peer_addr, "consumer attached");
    }

    /// Copy producer bytes into every attached consumer's ring buffer.
    async fn fan_out(&self, bytes: &[u8]) {
        let mut consumers = self.consumers.write().await;
        for consumer in consumers.iter_mut() {
            consumer.ring.write(bytes);
        }
        self.stats.bytes_relayed.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }

    /// Drive a single accepted producer connection until it closes. Runs as
    /// its own task; a new producer accept simply spawns another one of
    /// these, which implicitly evicts the prior producer once its read
    /// returns an error against the now-closed socket.
    pub async fn run_producer(&self, mut stream: TcpStream, shutdown: Arc<Notify>) {
        {
            let mut present = self.producer_present.write().await;
            if *present {
                info!(pipe = %self.name, "replacing existing producer");
            }
            *present = true;
        }

        let mut buf = vec![0u8; PRODUCER_READ_CHUNK];
        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!(pipe = %self.name, "producer EOF");
                            break;
                        }
                        Ok(n) => self.fan_out(&buf[..n]).await,
                        Err(e) => {
                            warn!(pipe = %self.name, error = %e, "producer read error");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        *self.producer_present.write().await = false;
    }

    /// Drain every consumer's ring buffer to its socket, dropping consumers
    /// on any non-transient send error. Runs on the pipe's periodic drain
    /// task. Each consumer's write is a non-blocking `try_write`, so one
    /// stuck socket never holds up the others or `fan_out` while this
    /// function holds the consumer list lock.
    pub async fn drain(&self) {
        let mut consumers = self.consumers.write().await;
        let mut i = 0;
        while i < consumers.len() {
            let drop_consumer = Self::drain_one(&mut consumers[i], self.header);
            if drop_consumer {
                let removed = consumers.swap_remove(i);
                info!(pipe = %self.name, peer = %removed.peer_addr, "consumer dropped");
            } else {
                i += 1;
            }
        }
    }

    /// Try to send one consumer's pending header and ring data without
    /// blocking. On would-block or a short write, the unsent bytes go back
    /// to the front of the ring per §4.2's "put bytes back" back-pressure
    /// rule, to be retried on the next drain tick. Returns `true` if the
    /// consumer's socket errored and should be dropped.
    fn drain_one(consumer: &mut Consumer, header: StreamHeader) -> bool {
        let header_bytes = header.to_bytes();
        if consumer.header_bytes_sent < header_bytes.len() {
            match consumer.stream.try_write(&header_bytes[consumer.header_bytes_sent..]) {
                Ok(n) => {
                    consumer.header_bytes_sent += n;
                    if consumer.header_bytes_sent < header_bytes.len() {
                        return false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }

        if consumer.ring.is_empty() {
            return false;
        }

        let chunk = consumer.ring.read(CONSUMER_DRAIN_CHUNK);
        match consumer.stream.try_write(&chunk) {
            Ok(n) if n == chunk.len() => {
                consumer.frames_sent += 1;
                false
            }
            Ok(n) => {
                consumer.ring.unread(&chunk[n..]);
                consumer.frames_sent += 1;
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                consumer.ring.unread(&chunk);
                false
            }
            Err(_) => true,
        }
    }
}
