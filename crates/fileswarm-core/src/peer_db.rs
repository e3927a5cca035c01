// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory registry of known peers.
//!
//! Peers are only ever added: one entry per distinct `host:port`, in the
//! order they were first seen. There is no liveness tracking and no removal;
//! a peer that goes away simply fails its next request.

use std::sync::{PoisonError, RwLock};

use crate::peer::PeerAddr;

#[derive(Debug, Default)]
pub struct PeerDb {
    peers: RwLock<Vec<PeerAddr>>,
}

impl PeerDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `false` when the address was already known.
    pub fn add(&self, addr: PeerAddr) -> bool {
        let mut peers = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if peers.contains(&addr) {
            return false;
        }
        peers.push(addr);
        true
    }

    /// Snapshot of every known peer, oldest first.
    pub fn all(&self) -> Vec<PeerAddr> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(addr)
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
