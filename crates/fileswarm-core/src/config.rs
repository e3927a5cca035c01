use std::net::SocketAddr;
use std::path::PathBuf;

use crate::net_fetch::FetchPolicy;

/// Everything a node needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory whose files are shared; downloads land here too.
    pub work_dir: PathBuf,
    /// Address the connection server binds to. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Host other peers are told to dial us back on.
    pub advertise_host: String,
    /// Client-side timeouts for outgoing requests.
    pub fetch: FetchPolicy,
}

impl NodeConfig {
    pub fn new(work_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            work_dir: work_dir.into(),
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
            advertise_host: "127.0.0.1".to_string(),
            fetch: FetchPolicy::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(".", 9000)
    }
}
