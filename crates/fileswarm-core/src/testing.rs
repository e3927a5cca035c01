//! Shared helpers for unit tests: scratch directories on disk and an
//! in-memory connector so protocol code can be exercised without sockets.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::net_fetch::{BoxedStream, PeerConnector};
use crate::peer::PeerAddr;
use crate::transport::{read_envelope, write_envelope};
use crate::wire::Envelope;

static SCRATCH_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Fresh empty directory under the system temp dir, unique per call.
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "fileswarm-test-{tag}-{}-{seq}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

pub(crate) fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
    std::fs::write(dir.join(name), bytes).expect("write test file");
}

/// Deterministic non-repeating byte pattern for file fixtures.
pub(crate) fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send>>;
type StreamFactory = Box<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Connector whose "network" is a map from peer key to an in-memory stream
/// factory. Peers without a route fail to connect.
#[derive(Default)]
pub(crate) struct MockConnector {
    routes: Mutex<HashMap<String, StreamFactory>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route<F>(&self, peer: &PeerAddr, factory: F)
    where
        F: Fn() -> ConnectFuture + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert(peer.key(), Box::new(factory));
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, peer: &PeerAddr) -> Result<BoxedStream> {
        let fut = {
            let routes = self.routes.lock().unwrap();
            match routes.get(&peer.key()) {
                Some(factory) => factory(),
                None => return Err(anyhow!("no route to {peer}")),
            }
        };
        fut.await
    }
}

/// Route that serves one request per connection through `handler`.
pub(crate) fn envelope_server<H>(handler: H) -> impl Fn() -> ConnectFuture + Send + Sync + 'static
where
    H: Fn(Envelope) -> Envelope + Clone + Send + Sync + 'static,
{
    move || {
        let handler = handler.clone();
        Box::pin(async move {
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                if let Ok(request) = read_envelope(&mut server).await {
                    let reply = handler(request);
                    let _ = write_envelope(&mut server, &reply).await;
                }
            });
            Ok(Box::new(client) as BoxedStream)
        }) as ConnectFuture
    }
}

/// Route that accepts the connection, swallows the request and never
/// answers. Drives timeout paths.
pub(crate) fn silent_server() -> impl Fn() -> ConnectFuture + Send + Sync + 'static {
    || {
        Box::pin(async {
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = read_envelope(&mut server).await;
                std::future::pending::<()>().await;
            });
            Ok(Box::new(client) as BoxedStream)
        }) as ConnectFuture
    }
}
