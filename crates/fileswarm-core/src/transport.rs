// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Length-prefixed framing for envelopes.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! CBOR. Frames above [`wire::MAX_ENVELOPE_BYTES`] are rejected before any
//! allocation happens.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{Envelope, MAX_ENVELOPE_BYTES};

pub async fn write_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_ENVELOPE_BYTES {
        bail!("frame too large: {} bytes", bytes.len());
    }
    stream
        .write_u32(bytes.len() as u32)
        .await
        .context("write frame length")?;
    stream.write_all(bytes).await.context("write frame body")?;
    stream.flush().await.context("flush frame")?;
    Ok(())
}

pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await.context("read frame length")? as usize;
    if len > MAX_ENVELOPE_BYTES {
        bail!("incoming frame too large: {len} bytes");
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .context("read frame body")?;
    Ok(buf)
}

pub async fn write_envelope<S>(stream: &mut S, env: &Envelope) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = env.encode()?;
    write_frame(stream, &bytes).await
}

pub async fn read_envelope<S>(stream: &mut S) -> Result<Envelope>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_frame(stream).await?;
    Envelope::decode(&bytes)
}
