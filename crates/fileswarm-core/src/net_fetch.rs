// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client side of the wire protocol.
//!
//! Every helper here opens a fresh connection through a [`PeerConnector`],
//! runs exactly one request/response exchange and validates the reply
//! before handing it back. [`TcpConnector`] is the production connector;
//! tests swap in an in-memory one.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::peer::PeerAddr;
use crate::transport::{read_envelope, write_envelope};
use crate::wire::{Envelope, GetBlock, Handshake, Search, SearchResult, WirePayload};

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type BoxedStream = Box<dyn AsyncIo>;

/// Opens a stream to a peer. The seam that lets tests run the whole
/// protocol over in-memory pipes.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &PeerAddr) -> Result<BoxedStream>;
}

/// Knobs for one fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Budget for a full exchange: connect, write request, read reply.
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Plain TCP dialer.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, peer: &PeerAddr) -> Result<BoxedStream> {
        let stream = TcpStream::connect((peer.host.as_str(), peer.port))
            .await
            .with_context(|| format!("connect to {peer}"))?;
        Ok(Box::new(stream))
    }
}

/// Run one request/response exchange on a fresh connection. The connect,
/// write and read all share `request_timeout`. Error-flagged replies and
/// replies correlating to a different request are turned into errors here,
/// so typed callers only ever see a well-formed answer.
pub async fn request_once<C>(
    connector: &C,
    peer: &PeerAddr,
    request: &Envelope,
    policy: &FetchPolicy,
) -> Result<Envelope>
where
    C: PeerConnector + ?Sized,
{
    trace!(%peer, r#type = request.r#type, req_id = request.req_id, "sending request");
    let reply = tokio::time::timeout(policy.request_timeout, async {
        let mut stream = connector.connect(peer).await?;
        write_envelope(&mut stream, request).await?;
        read_envelope(&mut stream).await
    })
    .await
    .map_err(|_| anyhow!("request to {peer} timed out"))??;

    if reply.req_id != request.req_id {
        bail!(
            "peer {peer} answered request {} instead of {}",
            reply.req_id,
            request.req_id
        );
    }
    if reply.is_error() {
        bail!(
            "peer {peer} reported error: {}",
            String::from_utf8_lossy(&reply.payload)
        );
    }
    Ok(reply)
}

/// Introduce ourselves to a peer; its own address comes back in the reply.
pub async fn handshake_peer<C>(
    connector: &C,
    peer: &PeerAddr,
    local: &Handshake,
    policy: &FetchPolicy,
) -> Result<Handshake>
where
    C: PeerConnector + ?Sized,
{
    let request = Envelope::request(1, &WirePayload::Handshake(local.clone()))?;
    let reply = request_once(connector, peer, &request, policy).await?;
    match reply.typed_payload()? {
        WirePayload::Handshake(hs) => Ok(hs),
        other => bail!(
            "peer {peer} answered handshake with {:?}",
            other.msg_type()
        ),
    }
}

/// Ask one peer for its catalog entries matching `keyword`.
pub async fn search_peer<C>(
    connector: &C,
    peer: &PeerAddr,
    keyword: &str,
    req_id: u32,
    policy: &FetchPolicy,
) -> Result<Vec<SearchResult>>
where
    C: PeerConnector + ?Sized,
{
    let request = Envelope::request(
        req_id,
        &WirePayload::Search(Search {
            keyword: keyword.to_string(),
        }),
    )?;
    let reply = request_once(connector, peer, &request, policy).await?;
    match reply.typed_payload()? {
        WirePayload::SearchResults(res) => Ok(res.results),
        other => bail!("peer {peer} answered search with {:?}", other.msg_type()),
    }
}

/// Fetch one block from a peer. The reply must echo the requested file and
/// offset and carry exactly `length` bytes; anything else, including the
/// empty-data "cannot serve" answer, is an error the caller treats as a
/// failed attempt.
pub async fn fetch_block<C>(
    connector: &C,
    peer: &PeerAddr,
    block: &GetBlock,
    req_id: u32,
    policy: &FetchPolicy,
) -> Result<Vec<u8>>
where
    C: PeerConnector + ?Sized,
{
    let request = Envelope::request(req_id, &WirePayload::GetBlock(block.clone()))?;
    let reply = request_once(connector, peer, &request, policy).await?;
    let data = match reply.typed_payload()? {
        WirePayload::BlockData(bd) => {
            if bd.file_name != block.file_name || bd.offset != block.offset {
                bail!(
                    "peer {peer} answered for wrong block: {} @ {}",
                    bd.file_name,
                    bd.offset
                );
            }
            bd.data
        }
        other => bail!("peer {peer} answered block request with {:?}", other.msg_type()),
    };
    if data.is_empty() {
        bail!(
            "peer {peer} has no data for {} @ {}",
            block.file_name,
            block.offset
        );
    }
    if data.len() != block.length as usize {
        bail!(
            "peer {peer} returned {} bytes for {} @ {}, wanted {}",
            data.len(),
            block.file_name,
            block.offset,
            block.length
        );
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope_server, silent_server, MockConnector};
    use crate::wire::{BlockData, MsgType, SearchResults};

    fn quick_policy() -> FetchPolicy {
        FetchPolicy {
            request_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn handshake_returns_remote_address() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 1);
        connector.route(
            &peer,
            envelope_server(|req| {
                let typed = req.typed_payload().unwrap();
                assert!(matches!(typed, WirePayload::Handshake(_)));
                Envelope::response(
                    req.req_id,
                    &WirePayload::Handshake(Handshake {
                        host: "10.0.0.2".into(),
                        port: 9002,
                    }),
                )
                .unwrap()
            }),
        );

        let local = Handshake {
            host: "10.0.0.1".into(),
            port: 9001,
        };
        let remote = handshake_peer(&connector, &peer, &local, &quick_policy())
            .await
            .unwrap();
        assert_eq!(remote.host, "10.0.0.2");
        assert_eq!(remote.port, 9002);
    }

    #[tokio::test]
    async fn search_returns_peer_results() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 2);
        connector.route(
            &peer,
            envelope_server(|req| {
                Envelope::response(
                    req.req_id,
                    &WirePayload::SearchResults(SearchResults {
                        results: vec![SearchResult {
                            keyword: "report".into(),
                            file_name: "report.pdf".into(),
                            file_size: 25_000,
                            origin_host: "mock".into(),
                            origin_port: 2,
                        }],
                    }),
                )
                .unwrap()
            }),
        );

        let results = search_peer(&connector, &peer, "report", 5, &quick_policy())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "report.pdf");
    }

    #[tokio::test]
    async fn fetch_block_validates_echo_and_length() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 3);
        connector.route(
            &peer,
            envelope_server(|req| {
                let WirePayload::GetBlock(gb) = req.typed_payload().unwrap() else {
                    panic!("expected GetBlock");
                };
                Envelope::response(
                    req.req_id,
                    &WirePayload::BlockData(BlockData {
                        file_name: gb.file_name,
                        offset: gb.offset,
                        data: vec![0xAB; gb.length as usize],
                    }),
                )
                .unwrap()
            }),
        );

        let block = GetBlock {
            file_name: "report.pdf".into(),
            offset: 10_240,
            length: 4520,
        };
        let data = fetch_block(&connector, &peer, &block, 9, &quick_policy())
            .await
            .unwrap();
        assert_eq!(data.len(), 4520);
    }

    #[tokio::test]
    async fn empty_block_data_is_a_failed_attempt() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 4);
        connector.route(
            &peer,
            envelope_server(|req| {
                let WirePayload::GetBlock(gb) = req.typed_payload().unwrap() else {
                    panic!("expected GetBlock");
                };
                Envelope::response(
                    req.req_id,
                    &WirePayload::BlockData(BlockData {
                        file_name: gb.file_name,
                        offset: gb.offset,
                        data: Vec::new(),
                    }),
                )
                .unwrap()
            }),
        );

        let block = GetBlock {
            file_name: "gone.bin".into(),
            offset: 0,
            length: 512,
        };
        let err = fetch_block(&connector, &peer, &block, 1, &quick_policy())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no data"));
    }

    #[tokio::test]
    async fn short_block_data_is_rejected() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 5);
        connector.route(
            &peer,
            envelope_server(|req| {
                let WirePayload::GetBlock(gb) = req.typed_payload().unwrap() else {
                    panic!("expected GetBlock");
                };
                Envelope::response(
                    req.req_id,
                    &WirePayload::BlockData(BlockData {
                        file_name: gb.file_name,
                        offset: gb.offset,
                        data: vec![1, 2, 3],
                    }),
                )
                .unwrap()
            }),
        );

        let block = GetBlock {
            file_name: "a.bin".into(),
            offset: 0,
            length: 100,
        };
        assert!(fetch_block(&connector, &peer, &block, 1, &quick_policy())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn error_flagged_reply_becomes_error() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 6);
        connector.route(
            &peer,
            envelope_server(|req| Envelope::error(req.req_id, MsgType::Search, "overloaded")),
        );

        let err = search_peer(&connector, &peer, "x", 1, &quick_policy())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn mismatched_req_id_is_rejected() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 7);
        connector.route(
            &peer,
            envelope_server(|req| {
                Envelope::response(
                    req.req_id + 1,
                    &WirePayload::SearchResults(SearchResults {
                        results: Vec::new(),
                    }),
                )
                .unwrap()
            }),
        );

        assert!(search_peer(&connector, &peer, "x", 1, &quick_policy())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("mock", 8);
        connector.route(&peer, silent_server());

        let err = search_peer(&connector, &peer, "x", 1, &quick_policy())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn unrouted_peer_fails_to_connect() {
        let connector = MockConnector::new();
        let peer = PeerAddr::new("nowhere", 9);

        assert!(search_peer(&connector, &peer, "x", 1, &quick_policy())
            .await
            .is_err());
    }
}
