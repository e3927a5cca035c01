// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server side of the wire protocol.
//!
//! The accept loop runs forever; each accepted connection gets its own task
//! that reads exactly one request, writes at most one reply and lets the
//! connection drop. A misbehaving connection only ever kills its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::catalog::FileCatalog;
use crate::peer::PeerAddr;
use crate::peer_db::PeerDb;
use crate::transport::{read_envelope, write_envelope};
use crate::wire::{
    BlockData, Envelope, GetBlock, Handshake, SearchResult, SearchResults, WirePayload,
    MAX_PAYLOAD_BYTES,
};

/// Shared state requests are answered from.
pub struct ServerContext {
    pub catalog: Arc<FileCatalog>,
    pub peers: Arc<PeerDb>,
    /// Address handed out in handshake replies and search results.
    pub local_host: String,
    pub local_port: u16,
}

/// Accepts connections and serves the one-request-per-connection protocol.
pub struct ConnectionServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl ConnectionServer {
    pub fn new(listener: TcpListener, ctx: Arc<ServerContext>) -> Self {
        Self { listener, ctx }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener local addr")
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(accept_loop(self.listener, self.ctx))
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let ctx = ctx.clone();
                tokio::spawn(handle_connection(stream, remote, ctx));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, ctx: Arc<ServerContext>) {
    let envelope = match read_envelope(&mut stream).await {
        Ok(env) => env,
        Err(err) => {
            debug!(%remote, error = %err, "dropping connection, bad request frame");
            return;
        }
    };
    let req_id = envelope.req_id;
    let typed = match envelope.typed_payload() {
        Ok(t) => t,
        Err(err) => {
            warn!(%remote, error = %err, "dropping connection, undecodable request");
            return;
        }
    };

    let reply = match typed {
        WirePayload::Handshake(hs) => {
            let addr = PeerAddr::new(hs.host, hs.port);
            if ctx.peers.add(addr.clone()) {
                debug!(peer = %addr, "registered peer from handshake");
            }
            Some(WirePayload::Handshake(Handshake {
                host: ctx.local_host.clone(),
                port: ctx.local_port,
            }))
        }
        WirePayload::Search(search) => {
            let results = ctx
                .catalog
                .find_by_keyword(&search.keyword)
                .into_iter()
                .map(|r| SearchResult {
                    keyword: search.keyword.clone(),
                    file_name: r.name,
                    file_size: r.size,
                    origin_host: ctx.local_host.clone(),
                    origin_port: ctx.local_port,
                })
                .collect();
            Some(WirePayload::SearchResults(SearchResults { results }))
        }
        WirePayload::GetBlock(req) => Some(WirePayload::BlockData(serve_block(&ctx.catalog, req).await)),
        WirePayload::SearchResults(_) | WirePayload::BlockData(_) => {
            warn!(%remote, "reply-typed message arrived as a request");
            None
        }
    };

    let Some(reply) = reply else { return };
    let env = match Envelope::response(req_id, &reply) {
        Ok(env) => env,
        Err(err) => {
            warn!(%remote, error = %err, "failed to encode reply");
            return;
        }
    };
    if let Err(err) = write_envelope(&mut stream, &env).await {
        debug!(%remote, error = %err, "failed to write reply");
    }
}

/// Answer a block request. Unknown files and read failures answer with the
/// empty-data form so the requester can move the block to another peer.
async fn serve_block(catalog: &FileCatalog, req: GetBlock) -> BlockData {
    let data = match read_block(catalog, &req).await {
        Ok(data) => data,
        Err(err) => {
            warn!(file = %req.file_name, offset = req.offset, error = %err, "cannot serve block");
            Vec::new()
        }
    };
    BlockData {
        file_name: req.file_name,
        offset: req.offset,
        data,
    }
}

async fn read_block(catalog: &FileCatalog, req: &GetBlock) -> Result<Vec<u8>> {
    if req.length as usize > MAX_PAYLOAD_BYTES {
        bail!("requested block length {} exceeds cap", req.length);
    }
    let record = catalog
        .find_by_name(&req.file_name)
        .with_context(|| format!("{} not in catalog", req.file_name))?;
    let mut file = tokio::fs::File::open(&record.path)
        .await
        .with_context(|| format!("open {}", record.path.display()))?;
    file.seek(std::io::SeekFrom::Start(req.offset))
        .await
        .context("seek to block offset")?;
    let mut buf = vec![0u8; req.length as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await.context("read block")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
