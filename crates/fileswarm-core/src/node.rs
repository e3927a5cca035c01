// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The node facade: one shared directory, one connection server, one peer
//! registry and at most one running download, tied together behind a small
//! embeddable API. Outcomes that happen off-thread (download results,
//! catalog rescans) arrive on the event stream returned by [`Node::start`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::catalog::{FileCatalog, FileRecord};
use crate::config::NodeConfig;
use crate::download::{DownloadCoordinator, DownloadReport};
use crate::net_fetch::{handshake_peer, PeerConnector, TcpConnector};
use crate::peer::PeerAddr;
use crate::peer_db::PeerDb;
use crate::search::fan_out_search;
use crate::server::{ConnectionServer, ServerContext};
use crate::wire::{Handshake, SearchResult};

/// Notifications a running node pushes to its embedder.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    DownloadFinished(DownloadReport),
    DownloadFailed { file_name: String, reason: String },
    CatalogRefreshed { files: usize },
}

pub struct Node {
    config: NodeConfig,
    local_port: u16,
    catalog: Arc<FileCatalog>,
    peers: Arc<PeerDb>,
    connector: Arc<dyn PeerConnector>,
    downloads: DownloadCoordinator,
    events: UnboundedSender<NodeEvent>,
    server: JoinHandle<()>,
}

impl Node {
    /// Create the shared directory if needed, scan it, bind the connection
    /// server and start serving. Returns the node plus the receiving end
    /// of its event stream.
    pub async fn start(config: NodeConfig) -> Result<(Self, UnboundedReceiver<NodeEvent>)> {
        std::fs::create_dir_all(&config.work_dir)
            .with_context(|| format!("create shared dir {}", config.work_dir.display()))?;
        let catalog = Arc::new(FileCatalog::new(config.work_dir.clone()));
        let shared = match catalog.refresh() {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "initial catalog scan failed, starting empty");
                0
            }
        };

        let peers = Arc::new(PeerDb::new());
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let local_port = listener.local_addr().context("listener local addr")?.port();
        let ctx = Arc::new(ServerContext {
            catalog: catalog.clone(),
            peers: peers.clone(),
            local_host: config.advertise_host.clone(),
            local_port,
        });
        let server = ConnectionServer::new(listener, ctx).spawn();

        let (events, event_rx) = mpsc::unbounded_channel();
        let downloads = DownloadCoordinator::new(config.work_dir.clone());
        debug!(port = local_port, files = shared, "node started");

        Ok((
            Self {
                config,
                local_port,
                catalog,
                peers,
                connector: Arc::new(TcpConnector),
                downloads,
                events,
                server,
            },
            event_rx,
        ))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn work_dir(&self) -> &Path {
        self.catalog.work_dir()
    }

    /// Dial a peer and exchange addresses. On success both sides know each
    /// other: we register the dialed address, the peer registers ours from
    /// the handshake body.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<()> {
        if self.is_self(host, port) {
            bail!("refusing to connect to self at {host}:{port}");
        }
        let peer = PeerAddr::new(host, port);
        let local = Handshake {
            host: self.config.advertise_host.clone(),
            port: self.local_port,
        };
        let remote = handshake_peer(self.connector.as_ref(), &peer, &local, &self.config.fetch)
            .await?;
        self.peers.add(peer.clone());
        debug!(%peer, remote_host = %remote.host, remote_port = remote.port, "handshake complete");
        Ok(())
    }

    fn is_self(&self, host: &str, port: u16) -> bool {
        if port != self.local_port {
            return false;
        }
        host == self.config.advertise_host || host == "localhost" || host == "127.0.0.1"
    }

    /// Keyword search across every known peer. Unreachable peers contribute
    /// nothing; the local catalog is not consulted.
    pub async fn search(&self, keyword: &str) -> Vec<SearchResult> {
        fan_out_search(
            self.connector.as_ref(),
            &self.peers.all(),
            keyword,
            &self.config.fetch,
        )
        .await
    }

    /// Start downloading `file_name` from `sources`. The outcome arrives on
    /// the event stream. Fails while another download is running.
    pub fn start_download(
        &self,
        file_name: &str,
        file_size: u64,
        sources: &[SearchResult],
    ) -> Result<()> {
        self.downloads.start(
            file_name,
            file_size,
            sources,
            self.connector.clone(),
            self.catalog.clone(),
            self.config.fetch.clone(),
            self.events.clone(),
        )
    }

    pub fn is_downloading(&self) -> bool {
        self.downloads.is_active()
    }

    /// Rescan the shared directory and emit [`NodeEvent::CatalogRefreshed`].
    pub fn refresh_catalog(&self) -> Result<usize> {
        let count = self.catalog.refresh()?;
        let _ = self.events.send(NodeEvent::CatalogRefreshed { files: count });
        Ok(count)
    }

    pub fn has_local_file(&self, name: &str) -> bool {
        self.catalog.has_file(name)
    }

    pub fn list_local_files(&self) -> Vec<FileRecord> {
        self.catalog.all()
    }

    pub fn known_peers(&self) -> Vec<PeerAddr> {
        self.peers.all()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::testing::{pattern_bytes, scratch_dir, write_file};

    async fn start_node(tag: &str) -> (Node, UnboundedReceiver<NodeEvent>, PathBuf) {
        let dir = scratch_dir(tag);
        let mut config = NodeConfig::new(&dir, 0);
        config.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        let (node, rx) = Node::start(config).await.unwrap();
        (node, rx, dir)
    }

    /// Port that nothing listens on.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn next_terminal_event(rx: &mut UnboundedReceiver<NodeEvent>) -> NodeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("event within deadline")
                .expect("event channel open");
            match event {
                NodeEvent::CatalogRefreshed { .. } => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn handshake_links_both_registries() {
        let (a, _ev_a, _dir_a) = start_node("node-hs-a").await;
        let (b, _ev_b, _dir_b) = start_node("node-hs-b").await;

        a.connect_to("127.0.0.1", b.local_port()).await.unwrap();

        assert!(a
            .known_peers()
            .contains(&PeerAddr::new("127.0.0.1", b.local_port())));
        assert!(b
            .known_peers()
            .contains(&PeerAddr::new("127.0.0.1", a.local_port())));
    }

    #[tokio::test]
    async fn connecting_to_self_is_refused() {
        let (a, _ev, _dir) = start_node("node-self").await;

        assert!(a.connect_to("127.0.0.1", a.local_port()).await.is_err());
        assert!(a.connect_to("localhost", a.local_port()).await.is_err());
        assert!(a.known_peers().is_empty());
    }

    #[tokio::test]
    async fn search_reaches_connected_peers() {
        let (a, _ev_a, _dir_a) = start_node("node-search-a").await;
        let (b, _ev_b, dir_b) = start_node("node-search-b").await;
        write_file(&dir_b, "annual-report.pdf", b"pdf");
        write_file(&dir_b, "music.mp3", b"mp3");
        b.refresh_catalog().unwrap();

        a.connect_to("127.0.0.1", b.local_port()).await.unwrap();
        let results = a.search("report").await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "annual-report.pdf");
        assert_eq!(results[0].origin_port, b.local_port());
    }

    #[tokio::test]
    async fn downloads_searched_file_end_to_end() {
        let (a, mut ev_a, dir_a) = start_node("node-dl-a").await;
        let (b, _ev_b, dir_b) = start_node("node-dl-b").await;
        let content = pattern_bytes(25_000);
        write_file(&dir_b, "report.pdf", &content);
        b.refresh_catalog().unwrap();

        a.connect_to("127.0.0.1", b.local_port()).await.unwrap();
        let mut sources = a.search("report.pdf").await;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].file_size, 25_000);

        // add a source that cannot be reached; its blocks migrate to b
        let mut unreachable = sources[0].clone();
        unreachable.origin_port = dead_port();
        sources.push(unreachable.clone());

        a.start_download("report.pdf", 25_000, &sources).unwrap();

        let NodeEvent::DownloadFinished(report) = next_terminal_event(&mut ev_a).await else {
            panic!("expected DownloadFinished");
        };
        assert_eq!(report.size_bytes, 25_000);
        let total: u64 = report.per_peer_blocks.values().sum();
        assert_eq!(total, 3);
        let dead_key = format!("127.0.0.1:{}", unreachable.origin_port);
        assert_eq!(report.per_peer_blocks.get(&dead_key).copied().unwrap_or(0), 0);

        assert_eq!(std::fs::read(dir_a.join("report.pdf")).unwrap(), content);
        // the rescan after assembly makes the file searchable from here on
        assert!(a.has_local_file("report.pdf"));
    }

    #[tokio::test]
    async fn download_with_only_dead_sources_fails() {
        let (a, mut ev_a, dir_a) = start_node("node-dl-dead").await;

        let sources = vec![SearchResult {
            keyword: "x".into(),
            file_name: "x.bin".into(),
            file_size: 30_000,
            origin_host: "127.0.0.1".into(),
            origin_port: dead_port(),
        }];
        a.start_download("x.bin", 30_000, &sources).unwrap();

        assert!(matches!(
            next_terminal_event(&mut ev_a).await,
            NodeEvent::DownloadFailed { .. }
        ));
        assert!(!dir_a.join("x.bin").exists());
        assert!(!a.is_downloading());
    }
}
