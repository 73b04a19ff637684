// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Newline-delimited JSON line framing shared by the registry and
//! rendezvous/splitter control channels.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::protocol::ProtocolError;

/// A connected peer speaking newline-delimited JSON in both directions.
pub struct LineConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl LineConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one newline-terminated line, deserializing it as `T`.
    ///
    /// Returns `Ok(None)` on a graceful EOF before any bytes accumulate.
    /// A line that never terminates within `max_message_size` bytes is a
    /// `ConnectionError::Protocol(BufferOverflow)` and resets the buffer.
    pub async fn read_line<T>(&mut self) -> Result<Option<T>, ConnectionError>
    where
        T: serde::de::DeserializeOwned,
    {
        loop {
            if let Some(pos) = self.read_buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.read_buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let value = serde_json::from_slice(line)
                    .map_err(|e| ConnectionError::Protocol(ProtocolError::InvalidJson(e.to_string())))?;
                return Ok(Some(value));
            }

            if self.read_buffer.len() >= self.max_message_size {
                self.read_buffer.clear();
                return Err(ConnectionError::Protocol(ProtocolError::BufferOverflow));
            }

            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?;
            if n == 0 {
                return if self.read_buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ConnectionError::Io("connection closed mid-line".into()))
                };
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serialize `value` and write it as one newline-terminated line.
    pub async fn write_line<T>(&mut self, value: &T) -> Result<(), ConnectionError>
    where
        T: serde::Serialize,
    {
        let mut json = serde_json::to_vec(value)
            .map_err(|e| ConnectionError::Protocol(ProtocolError::InvalidJson(e.to_string())))?;
        json.push(b'\n');
        self.stream
            .write_all(&json)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}

/// Connection-layer error types.
#[derive(Debug)]
pub enum ConnectionError {
    Io(String),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn test_read_line_roundtrip() {
        let (server, mut client) = connected_pair().await;
        let addr = server.peer_addr().unwrap();
        let mut conn = LineConnection::new(server, addr, 4096);

        client.write_all(b"{\"cmd\":\"list\"}\n").await.unwrap();

        let value: serde_json::Value = conn.read_line().await.unwrap().unwrap();
        assert_eq!(value["cmd"], "list");
    }

    #[tokio::test]
    async fn test_read_line_eof_returns_none() {
        let (server, client) = connected_pair().await;
        let addr = server.peer_addr().unwrap();
        let mut conn = LineConnection::new(server, addr, 4096);
        drop(client);

        let value: Option<serde_json::Value> = conn.read_line().await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_read_line_overflow_is_protocol_error() {
        let (server, mut client) = connected_pair().await;
        let addr = server.peer_addr().unwrap();
        let mut conn = LineConnection::new(server, addr, 8);

        client.write_all(b"0123456789").await.unwrap();

        let result: Result<Option<serde_json::Value>, _> = conn.read_line().await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolError::BufferOverflow))
        ));
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let (server, mut client) = connected_pair().await;
        let addr = server.peer_addr().unwrap();
        let mut conn = LineConnection::new(server, addr, 4096);

        conn.write_line(&serde_json::json!({"cmd": "list"}))
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[n - 1..n], b"\n");
    }
}
