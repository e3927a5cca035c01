pub mod catalog;
pub mod cbor;
pub mod config;
pub mod download;
pub mod net_fetch;
pub mod node;
pub mod peer;
pub mod peer_db;
pub mod search;
pub mod server;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{FileCatalog, FileRecord};
pub use config::NodeConfig;
pub use download::{DownloadCoordinator, DownloadReport, BLOCK_SIZE};
pub use net_fetch::{
    fetch_block, handshake_peer, search_peer, BoxedStream, FetchPolicy, PeerConnector,
    TcpConnector,
};
pub use node::{Node, NodeEvent};
pub use peer::PeerAddr;
pub use peer_db::PeerDb;
pub use search::fan_out_search;
pub use server::{ConnectionServer, ServerContext};
pub use transport::{read_envelope, write_envelope};
pub use wire::{
    BlockData, Envelope, GetBlock, Handshake, MsgType, Search, SearchResult, SearchResults,
    WirePayload, FLAG_ERROR, FLAG_RESPONSE,
};
