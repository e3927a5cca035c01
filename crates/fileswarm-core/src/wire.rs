// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire message definitions.
//!
//! Every exchange on the network is one CBOR-encoded [`Envelope`] carrying a
//! typed payload. A connection serves exactly one request/response pair:
//! the requester writes one envelope, reads one envelope back, and the
//! connection is done.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Envelope flag: this envelope answers a request (echoes its `req_id`).
pub const FLAG_RESPONSE: u16 = 0x0001;
/// Envelope flag: the responder failed to serve the request; `payload`
/// holds a UTF-8 diagnostic instead of a typed message.
pub const FLAG_ERROR: u16 = 0x0002;

/// Hard cap on a whole encoded envelope.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;
/// Hard cap on the inner payload of an envelope.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Message type discriminants. The numeric values are the protocol; they
/// never change meaning once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Handshake = 100,
    Search = 200,
    SearchResults = 201,
    GetBlock = 300,
    BlockData = 301,
}

impl MsgType {
    pub const ALL: [MsgType; 5] = [
        MsgType::Handshake,
        MsgType::Search,
        MsgType::SearchResults,
        MsgType::GetBlock,
        MsgType::BlockData,
    ];
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> Result<Self> {
        for t in MsgType::ALL {
            if t as u16 == value {
                return Ok(t);
            }
        }
        Err(anyhow!("unknown message type {value}"))
    }
}

/// Outer frame of every wire exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Discriminant from [`MsgType`].
    pub r#type: u16,
    /// Correlates a response with the request that caused it.
    pub req_id: u32,
    /// Bitwise OR of `FLAG_*` values.
    pub flags: u16,
    /// CBOR encoding of the typed message named by `r#type`.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build a request envelope around a typed payload.
    pub fn request(req_id: u32, payload: &WirePayload) -> Result<Self> {
        Self::build(req_id, 0, payload)
    }

    /// Build a response envelope echoing `req_id`.
    pub fn response(req_id: u32, payload: &WirePayload) -> Result<Self> {
        Self::build(req_id, FLAG_RESPONSE, payload)
    }

    /// Build an error response; `message` travels as the raw payload.
    pub fn error(req_id: u32, msg_type: MsgType, message: &str) -> Self {
        Self {
            r#type: msg_type as u16,
            req_id,
            flags: FLAG_RESPONSE | FLAG_ERROR,
            payload: message.as_bytes().to_vec(),
        }
    }

    fn build(req_id: u32, flags: u16, payload: &WirePayload) -> Result<Self> {
        let bytes = payload.encode()?;
        if bytes.len() > MAX_PAYLOAD_BYTES {
            bail!("payload too large: {} bytes", bytes.len());
        }
        Ok(Self {
            r#type: payload.msg_type() as u16,
            req_id,
            flags,
            payload: bytes,
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = crate::cbor::to_vec(self).context("encode envelope")?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            bail!("envelope too large: {} bytes", bytes.len());
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_with_limits(bytes, MAX_ENVELOPE_BYTES, MAX_PAYLOAD_BYTES)
    }

    pub fn decode_with_limits(
        bytes: &[u8],
        max_envelope: usize,
        max_payload: usize,
    ) -> Result<Self> {
        if bytes.len() > max_envelope {
            bail!("envelope too large: {} bytes", bytes.len());
        }
        let env: Envelope = crate::cbor::from_slice(bytes).context("decode envelope")?;
        if env.payload.len() > max_payload {
            bail!("envelope payload too large: {} bytes", env.payload.len());
        }
        Ok(env)
    }

    /// Decode the inner payload as the typed message named by `r#type`.
    pub fn typed_payload(&self) -> Result<WirePayload> {
        if self.is_error() {
            bail!(
                "peer reported error: {}",
                String::from_utf8_lossy(&self.payload)
            );
        }
        let msg_type = MsgType::try_from(self.r#type)?;
        WirePayload::decode(msg_type, &self.payload)
    }
}

/// Sent by a node when it joins another node's mesh. The receiver registers
/// the sender and answers with its own `Handshake`, so one dial links both
/// registries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub host: String,
    pub port: u16,
}

/// Keyword query against a peer's local catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Search {
    pub keyword: String,
}

/// Answer to [`Search`]: every catalog entry whose name contains the
/// keyword. May be empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
}

/// One file a peer offers for download. `origin_host`/`origin_port` name
/// the node that holds the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub keyword: String,
    pub file_name: String,
    pub file_size: u64,
    pub origin_host: String,
    pub origin_port: u16,
}

/// Request for one block of a file, addressed by name. `length` is the
/// exact number of bytes expected back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetBlock {
    pub file_name: String,
    pub offset: u64,
    pub length: u32,
}

/// Answer to [`GetBlock`]. An empty `data` signals the responder could not
/// serve the block (unknown file, read failure).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockData {
    pub file_name: String,
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Closed set of typed wire messages. Dispatch is a `match` over this enum;
/// there is no open registration of handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Handshake(Handshake),
    Search(Search),
    SearchResults(SearchResults),
    GetBlock(GetBlock),
    BlockData(BlockData),
}

impl WirePayload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            WirePayload::Handshake(_) => MsgType::Handshake,
            WirePayload::Search(_) => MsgType::Search,
            WirePayload::SearchResults(_) => MsgType::SearchResults,
            WirePayload::GetBlock(_) => MsgType::GetBlock,
            WirePayload::BlockData(_) => MsgType::BlockData,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            WirePayload::Handshake(m) => crate::cbor::to_vec(m),
            WirePayload::Search(m) => crate::cbor::to_vec(m),
            WirePayload::SearchResults(m) => crate::cbor::to_vec(m),
            WirePayload::GetBlock(m) => crate::cbor::to_vec(m),
            WirePayload::BlockData(m) => crate::cbor::to_vec(m),
        };
        bytes.context("encode wire payload")
    }

    pub fn decode(msg_type: MsgType, payload: &[u8]) -> Result<Self> {
        let typed = match msg_type {
            MsgType::Handshake => WirePayload::Handshake(crate::cbor::from_slice(payload)?),
            MsgType::Search => WirePayload::Search(crate::cbor::from_slice(payload)?),
            MsgType::SearchResults => {
                WirePayload::SearchResults(crate::cbor::from_slice(payload)?)
            }
            MsgType::GetBlock => WirePayload::GetBlock(crate::cbor::from_slice(payload)?),
            MsgType::BlockData => WirePayload::BlockData(crate::cbor::from_slice(payload)?),
        };
        Ok(typed)
    }
}
