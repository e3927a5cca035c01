// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Catalog of files this node shares.
//!
//! The catalog mirrors the top level of a single working directory. Entries
//! are keyed by SHA-256 of the file content, so two names with identical
//! bytes collapse to one entry. [`FileCatalog::refresh`] rebuilds the whole
//! map from disk and swaps it in atomically; readers between refreshes see
//! either the old snapshot or the new one, never a mix.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// One shared file: content hash, display name, size and on-disk location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub content_hash: [u8; 32],
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct FileCatalog {
    work_dir: PathBuf,
    files: RwLock<HashMap<[u8; 32], FileRecord>>,
}

impl FileCatalog {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Rescan the working directory and replace the catalog with what is on
    /// disk now. Unreadable entries are skipped with a warning; only a
    /// failure to list the directory itself is an error. Returns the number
    /// of cataloged files.
    ///
    /// Hashing happens outside the lock. This does blocking file I/O; call
    /// it from a blocking context.
    pub fn refresh(&self) -> Result<usize> {
        let mut next = HashMap::new();
        let entries = std::fs::read_dir(&self.work_dir)
            .with_context(|| format!("list shared dir {}", self.work_dir.display()))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable dir entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match scan_file(&path) {
                Ok(record) => {
                    next.insert(record.content_hash, record);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable file");
                }
            }
        }

        let count = next.len();
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        *files = next;
        drop(files);
        debug!(files = count, dir = %self.work_dir.display(), "catalog refreshed");
        Ok(count)
    }

    /// Case-sensitive substring match on file names.
    pub fn find_by_keyword(&self, keyword: &str) -> Vec<FileRecord> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.name.contains(keyword))
            .cloned()
            .collect()
    }

    /// Exact name lookup, used to serve block requests.
    pub fn find_by_name(&self, name: &str) -> Option<FileRecord> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    pub fn all(&self) -> Vec<FileRecord> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scan_file(path: &Path) -> Result<FileRecord> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("non-utf8 file name at {}", path.display()))?
        .to_string();
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(FileRecord {
        content_hash: hasher.finalize().into(),
        name,
        size,
        path: path.to_path_buf(),
    })
}
