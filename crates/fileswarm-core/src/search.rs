use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tracing::warn;

use crate::net_fetch::{search_peer, FetchPolicy, PeerConnector};
use crate::peer::PeerAddr;
use crate::wire::SearchResult;

/// Query every peer in parallel and return the union of their results.
///
/// A peer that fails or times out contributes nothing; its error is logged
/// and the others are unaffected. The fan-out waits until every peer has
/// answered or failed, so the caller always sees a settled result set.
/// Results are not deduplicated: the same file offered by two peers shows
/// up twice, once per origin.
pub async fn fan_out_search<C>(
    connector: &C,
    peers: &[PeerAddr],
    keyword: &str,
    policy: &FetchPolicy,
) -> Vec<SearchResult>
where
    C: PeerConnector + ?Sized,
{
    let mut in_flight: FuturesUnordered<_> = peers
        .iter()
        .enumerate()
        .map(|(idx, peer)| async move {
            let outcome = search_peer(connector, peer, keyword, idx as u32 + 1, policy).await;
            (peer, outcome)
        })
        .collect();

    let mut aggregated = Vec::new();
    while let Some((peer, outcome)) = in_flight.next().await {
        match outcome {
            Ok(mut results) => aggregated.append(&mut results),
            Err(err) => warn!(%peer, error = %err, "peer search failed"),
        }
    }
    aggregated
}
