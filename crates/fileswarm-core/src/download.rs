// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-source block download.
//!
//! One download runs at a time. The file is cut into fixed-size blocks
//! queued FIFO; each source peer gets one worker that pulls blocks off the
//! shared queue until the queue drains or the worker fails once. A failed
//! worker puts its block back at the END of the queue and retires for the
//! rest of the session, so a flaky peer costs a single attempt and its
//! blocks migrate to the survivors. An assembler task waits for completion
//! or collapse, writes the file, rescans the catalog and reports on the
//! node event channel.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::catalog::FileCatalog;
use crate::net_fetch::{fetch_block, FetchPolicy, PeerConnector};
use crate::node::NodeEvent;
use crate::peer::PeerAddr;
use crate::wire::{GetBlock, SearchResult};

/// Fixed block size in bytes. The last block of a file is shorter unless
/// the size is an exact multiple.
pub const BLOCK_SIZE: u64 = 10_240;

/// Summary of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub file_name: String,
    pub size_bytes: u64,
    pub elapsed: Duration,
    /// Blocks served by each peer, keyed by `host:port`.
    pub per_peer_blocks: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Assembling,
}

#[derive(Debug)]
struct Session {
    /// Bumped on every `start`. Workers only touch state belonging to the
    /// generation they were spawned for.
    generation: u64,
    phase: Phase,
    file_name: String,
    file_size: u64,
    total_blocks: u64,
    pending: VecDeque<GetBlock>,
    /// Fetched blocks keyed by block index (`offset / BLOCK_SIZE`).
    completed: HashMap<u64, Vec<u8>>,
    completed_count: u64,
    per_peer_blocks: HashMap<String, u64>,
    active_workers: usize,
    failed: bool,
    started_at: Instant,
}

impl Session {
    fn idle() -> Self {
        Self {
            generation: 0,
            phase: Phase::Idle,
            file_name: String::new(),
            file_size: 0,
            total_blocks: 0,
            pending: VecDeque::new(),
            completed: HashMap::new(),
            completed_count: 0,
            per_peer_blocks: HashMap::new(),
            active_workers: 0,
            failed: false,
            started_at: Instant::now(),
        }
    }

    fn is_done(&self) -> bool {
        self.failed || self.completed_count >= self.total_blocks
    }
}

pub struct DownloadCoordinator {
    work_dir: PathBuf,
    state: Arc<Mutex<Session>>,
    done: Arc<Notify>,
}

impl DownloadCoordinator {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            state: Arc::new(Mutex::new(Session::idle())),
            done: Arc::new(Notify::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).phase != Phase::Idle
    }

    /// Begin downloading `file_name` from `sources`: one worker per source
    /// entry plus an assembler waiting on the outcome. Rejected while a
    /// previous session has not returned to idle.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        file_name: &str,
        file_size: u64,
        sources: &[SearchResult],
        connector: Arc<dyn PeerConnector>,
        catalog: Arc<FileCatalog>,
        policy: FetchPolicy,
        events: UnboundedSender<NodeEvent>,
    ) -> Result<()> {
        if sources.is_empty() {
            bail!("no sources for {file_name}");
        }
        let generation;
        {
            let mut session = lock(&self.state);
            if session.phase != Phase::Idle {
                bail!("a download is already in progress");
            }
            generation = session.generation + 1;
            let pending = plan_blocks(file_name, file_size);
            // every source shows up in the report, even with zero blocks
            let per_peer_blocks = sources
                .iter()
                .map(|s| (PeerAddr::new(s.origin_host.clone(), s.origin_port).key(), 0))
                .collect();
            *session = Session {
                generation,
                phase: Phase::Active,
                file_name: file_name.to_string(),
                file_size,
                total_blocks: pending.len() as u64,
                pending,
                completed: HashMap::new(),
                completed_count: 0,
                per_peer_blocks,
                active_workers: sources.len(),
                failed: false,
                started_at: Instant::now(),
            };
        }
        info!(
            file = file_name,
            size = file_size,
            sources = sources.len(),
            "download started"
        );

        for (worker_id, source) in sources.iter().enumerate() {
            tokio::spawn(run_worker(
                self.state.clone(),
                self.done.clone(),
                connector.clone(),
                policy.clone(),
                PeerAddr::new(source.origin_host.clone(), source.origin_port),
                worker_id as u32,
                generation,
            ));
        }
        tokio::spawn(run_assembler(
            self.state.clone(),
            self.done.clone(),
            self.work_dir.clone(),
            catalog,
            events,
        ));
        Ok(())
    }
}

/// Cut a file into the FIFO block queue. The final block covers the
/// remainder, so 25000 bytes becomes lengths 10240, 10240, 4520.
fn plan_blocks(file_name: &str, file_size: u64) -> VecDeque<GetBlock> {
    let mut blocks = VecDeque::new();
    let mut offset = 0u64;
    while offset < file_size {
        let length = (file_size - offset).min(BLOCK_SIZE) as u32;
        blocks.push_back(GetBlock {
            file_name: file_name.to_string(),
            offset,
            length,
        });
        offset += u64::from(length);
    }
    blocks
}

fn lock(state: &Mutex<Session>) -> MutexGuard<'_, Session> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_worker(
    state: Arc<Mutex<Session>>,
    done: Arc<Notify>,
    connector: Arc<dyn PeerConnector>,
    policy: FetchPolicy,
    peer: PeerAddr,
    worker_id: u32,
    generation: u64,
) {
    let peer_key = peer.key();
    // distinct request id space per worker
    let mut req_id = worker_id << 16;
    loop {
        let block = {
            let mut session = lock(&state);
            if session.generation != generation || session.failed {
                None
            } else {
                session.pending.pop_front()
            }
        };
        let Some(block) = block else { break };
        req_id += 1;
        match fetch_block(connector.as_ref(), &peer, &block, req_id, &policy).await {
            Ok(data) => {
                let mut session = lock(&state);
                if session.generation != generation {
                    break;
                }
                session.completed.insert(block.offset / BLOCK_SIZE, data);
                session.completed_count += 1;
                *session.per_peer_blocks.entry(peer_key.clone()).or_insert(0) += 1;
                if session.completed_count >= session.total_blocks {
                    done.notify_one();
                }
            }
            Err(err) => {
                warn!(%peer, offset = block.offset, error = %err, "block fetch failed, retiring worker");
                let mut session = lock(&state);
                if session.generation == generation {
                    session.pending.push_back(block);
                }
                break;
            }
        }
    }

    let mut session = lock(&state);
    if session.generation != generation {
        return;
    }
    session.active_workers -= 1;
    debug!(%peer, remaining_workers = session.active_workers, "worker done");
    if session.active_workers == 0 && !session.is_done() {
        session.failed = true;
        done.notify_one();
    }
}

async fn run_assembler(
    state: Arc<Mutex<Session>>,
    done: Arc<Notify>,
    work_dir: PathBuf,
    catalog: Arc<FileCatalog>,
    events: UnboundedSender<NodeEvent>,
) {
    loop {
        if lock(&state).is_done() {
            break;
        }
        done.notified().await;
    }

    let (file_name, file_size, failed, total_blocks, completed, per_peer, elapsed) = {
        let mut session = lock(&state);
        session.phase = Phase::Assembling;
        (
            session.file_name.clone(),
            session.file_size,
            session.failed,
            session.total_blocks,
            std::mem::take(&mut session.completed),
            std::mem::take(&mut session.per_peer_blocks),
            session.started_at.elapsed(),
        )
    };

    if failed {
        warn!(file = %file_name, "download failed, every worker retired before completion");
        reset_idle(&state);
        let _ = events.send(NodeEvent::DownloadFailed {
            file_name,
            reason: "all sources failed".to_string(),
        });
        return;
    }

    let path = work_dir.join(&file_name);
    match write_assembled(&path, total_blocks, completed).await {
        Ok(()) => {
            let refresh_catalog = catalog.clone();
            let rescan = tokio::task::spawn_blocking(move || refresh_catalog.refresh()).await;
            reset_idle(&state);
            match rescan {
                Ok(Ok(count)) => {
                    let _ = events.send(NodeEvent::CatalogRefreshed { files: count });
                }
                Ok(Err(err)) => warn!(error = %err, "catalog rescan after download failed"),
                Err(err) => warn!(error = %err, "catalog rescan task failed"),
            }
            info!(file = %file_name, bytes = file_size, ?elapsed, "download finished");
            let _ = events.send(NodeEvent::DownloadFinished(DownloadReport {
                file_name,
                size_bytes: file_size,
                elapsed,
                per_peer_blocks: per_peer,
            }));
        }
        Err(err) => {
            warn!(file = %file_name, error = %err, "failed to write assembled file");
            reset_idle(&state);
            let _ = events.send(NodeEvent::DownloadFailed {
                file_name,
                reason: err.to_string(),
            });
        }
    }
}

/// Write fetched blocks to `path` in index order. A missing index is
/// logged and skipped, leaving a shorter file.
async fn write_assembled(
    path: &Path,
    total_blocks: u64,
    mut completed: HashMap<u64, Vec<u8>>,
) -> Result<()> {
    let mut out = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;
    for index in 0..total_blocks {
        match completed.remove(&index) {
            Some(data) => out
                .write_all(&data)
                .await
                .with_context(|| format!("write block {index} to {}", path.display()))?,
            None => warn!(index, path = %path.display(), "block missing at assembly"),
        }
    }
    out.flush().await.context("flush assembled file")?;
    Ok(())
}

/// Return to idle, keeping the generation so stragglers from the finished
/// session cannot touch the next one.
fn reset_idle(state: &Mutex<Session>) {
    let mut session = lock(state);
    let generation = session.generation;
    *session = Session {
        generation,
        ..Session::idle()
    };
}
