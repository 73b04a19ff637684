// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocols used across the relay's subsystems.
//!
//! Three distinct wire formats live here:
//! - The binary `StreamHeader`/`DataFrame` preambles that precede a
//!   BroadcastPipe's byte stream (never parsed past the header, only
//!   constructed and replayed).
//! - The newline-delimited JSON rendezvous and splitter-control protocol.
//! - The newline-delimited JSON registry protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Magic tag identifying a `StreamHeader`: ASCII `"FT32"`.
pub const STREAM_HEADER_MAGIC: u32 = 0x4654_3332;

/// Magic tag identifying a `DataFrame` header: ASCII `"DATA"`. The relay
/// never inspects frames past this point — they pass through as payload.
#[allow(dead_code)]
pub const DATA_FRAME_MAGIC: u32 = 0x4441_5441;

/// The 16-byte preamble replayed to every new BroadcastPipe consumer before
/// any producer byte. Encoded little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub sample_rate: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl StreamHeader {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            reserved1: 0,
            reserved2: 0,
        }
    }

    /// Encode into the 16-byte wire representation.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&STREAM_HEADER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[8..12].copy_from_slice(&self.reserved1.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved2.to_le_bytes());
        buf
    }
}

/// Rendezvous and splitter-control messages, tagged `"t":"r"` for the
/// rendezvous handshake or `"t":"s"` for an opaque-payload frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum SplitterMessage {
    #[serde(rename = "r")]
    Rendezvous(RendezvousCommand),
    #[serde(rename = "s")]
    Data { d: String },
}

impl SplitterMessage {
    /// Build an outbound opaque-payload frame, base64-encoding `payload`.
    ///
    /// The original in-band JSON string escaping of this field dropped
    /// non-printable bytes. Base64 makes the encoding lossless for
    /// arbitrary byte payloads.
    pub fn data_frame(payload: &[u8]) -> Self {
        SplitterMessage::Data {
            d: BASE64.encode(payload),
        }
    }

    /// Decode an opaque-payload frame back to raw bytes.
    pub fn decode_payload(d: &str) -> Result<Vec<u8>, ProtocolError> {
        BASE64
            .decode(d)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "c")]
pub enum RendezvousCommand {
    #[serde(rename = "hello")]
    Hello { id: String },
    #[serde(rename = "assign")]
    Assign { p: u16 },
    #[serde(rename = "ready")]
    Ready {
        #[serde(with = "bool_as_string")]
        has_sdr: bool,
    },
    #[serde(rename = "ports")]
    Ports { det: u16, disp: u16 },
    #[serde(rename = "pong")]
    Pong,
}

/// The protocol carries this one boolean as the strings `"true"`/`"false"`,
/// matching the original wire format rather than a native JSON bool.
mod bool_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected \"true\"/\"false\", got {:?}",
                other
            ))),
        }
    }
}

/// Registry protocol request, driven by JSON lines on the registry port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum RegistryRequest {
    Helo {
        id: String,
        svc: String,
        port: u16,
        data: u16,
        #[serde(default)]
        caps: String,
    },
    Bye {
        id: String,
        #[serde(default)]
        svc: Option<String>,
    },
    List,
    Find {
        svc: String,
    },
}

/// A single service entry as it appears in a registry list/find reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    pub id: String,
    pub svc: String,
    pub ip: String,
    pub port: u16,
    pub data: u16,
    pub caps: String,
}

/// Reply envelope for `list`/`find` queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryReply {
    pub m: String,
    pub v: u32,
    pub cmd: String,
    pub services: Vec<ServiceEntry>,
}

impl RegistryReply {
    pub fn list(services: Vec<ServiceEntry>) -> Self {
        Self {
            m: "PNSD".into(),
            v: 1,
            cmd: "list".into(),
            services,
        }
    }
}

/// Protocol error types shared by every JSON-framed subsystem.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    InvalidJson(String),
    InvalidPayload(String),
    BufferOverflow,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(s) => write!(f, "invalid JSON: {}", s),
            Self::InvalidPayload(s) => write!(f, "invalid payload encoding: {}", s),
            Self::BufferOverflow => write!(f, "message exceeded buffer without newline"),
        }
    }
}

impl std::error::Error for ProtocolError {}
