//! N-ary interpolation search for the block at a timestamp against a remote node.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeBounds;

use chaincache_core::{BlockRef, ChainClient, ClientError, TimestampMode};
use futures::future::join_all;
use tracing::{debug, info};

use crate::error::ResolveError;

/// Block timestamps fetched while resolving, owned by the caller and reusable
/// across calls that want to share probes. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct TimestampSearchCache {
    timestamps: BTreeMap<u64, u64>,
}

impl TimestampSearchCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, number: u64) -> Option<u64> {
        self.timestamps.get(&number).copied()
    }

    pub fn insert(&mut self, number: u64, timestamp: u64) {
        self.timestamps.insert(number, timestamp);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn range(&self, numbers: impl RangeBounds<u64>) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.timestamps
            .range(numbers)
            .map(|(number, timestamp)| (*number, *timestamp))
    }
}

/// One narrowing step of the network search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRound {
    pub lo: u64,
    pub hi: u64,
    pub probes: Vec<u64>,
    pub interpolated: bool,
}

#[derive(Debug)]
pub(crate) struct SearchOutcome {
    pub block_number: u64,
    pub head: u64,
    /// Blocks fetched from the client during this search, in fetch order.
    pub fetched: Vec<BlockRef>,
    pub trail: Vec<SearchRound>,
}

struct NetworkSearch<'a> {
    client: &'a dyn ChainClient,
    cache: &'a mut TimestampSearchCache,
    fetched: Vec<BlockRef>,
}

impl NetworkSearch<'_> {
    fn finish(self, head: u64, block_number: u64, trail: Vec<SearchRound>) -> SearchOutcome {
        SearchOutcome {
            block_number,
            head,
            fetched: self.fetched,
            trail,
        }
    }

    fn record(&mut self, block: BlockRef) {
        self.cache.insert(block.number, block.timestamp);
        self.fetched.push(block);
    }

    async fn timestamp_of(&mut self, number: u64) -> Result<u64, ClientError> {
        if let Some(timestamp) = self.cache.get(number) {
            return Ok(timestamp);
        }
        let block = self.client.block(number).await?;
        self.record(block);
        Ok(block.timestamp)
    }

    /// Timestamps of `probes`, fetching the uncached ones concurrently. Blocks
    /// that arrived are cached even when another probe of the round failed.
    async fn fetch_round(&mut self, probes: &[u64]) -> Result<Vec<(u64, u64)>, ClientError> {
        let missing: Vec<u64> = probes
            .iter()
            .copied()
            .filter(|number| self.cache.get(*number).is_none())
            .collect();
        let client = self.client;
        let results = join_all(missing.iter().map(|number| client.block(*number))).await;
        let mut failure = None;
        for result in results {
            match result {
                Ok(block) => self.record(block),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        probes
            .iter()
            .map(|number| {
                self.cache
                    .get(*number)
                    .map(|timestamp| (*number, timestamp))
                    .ok_or(ClientError::BlockNotFound(*number))
            })
            .collect()
    }
}

/// Whether a block with `timestamp` lies on the upper side of the answer.
fn is_upper(timestamp: u64, target: u64, mode: TimestampMode) -> bool {
    match mode {
        TimestampMode::Before => timestamp > target,
        TimestampMode::After | TimestampMode::Equal => timestamp >= target,
    }
}

fn scale(value: u64, numerator: u64, denominator: u64) -> u64 {
    let scaled = u128::from(value) * u128::from(numerator) / u128::from(denominator.max(1));
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

fn even_probes(lo: u64, hi: u64, nary: u64) -> Vec<u64> {
    let width = hi - lo;
    let probes: BTreeSet<u64> = (1..nary)
        .map(|step| lo + scale(width, step, nary))
        .filter(|probe| *probe > lo && *probe < hi)
        .collect();
    probes.into_iter().collect()
}

/// Probes clustered around the block a constant block time would put `target`
/// at, `width / nary²` apart.
fn interpolated_probes(
    (lo, ts_lo): (u64, u64),
    (hi, ts_hi): (u64, u64),
    target: u64,
    nary: u64,
) -> Vec<u64> {
    let width = hi - lo;
    let offset = scale(
        width,
        target.saturating_sub(ts_lo),
        ts_hi.saturating_sub(ts_lo),
    );
    let estimate = lo.saturating_add(offset).clamp(lo + 1, hi - 1);
    let count = nary - 1;
    let spread = (width / nary.saturating_mul(nary)).max(1);
    let extent = spread.saturating_mul(count - 1);
    // Shift the cluster as a whole so it stays `count` distinct blocks near an edge.
    let first = estimate
        .saturating_sub(extent / 2)
        .min((hi - 1).saturating_sub(extent))
        .max(lo + 1);
    (0..count)
        .map(|step| first.saturating_add(spread * step))
        .filter(|probe| *probe < hi)
        .collect()
}

/// Finds the block at `target` by narrowing a bracket `[lo, hi]` with
/// `ts(lo)` below and `ts(hi)` at or above the answer side for `mode`.
pub(crate) async fn search_block_of_timestamp(
    client: &dyn ChainClient,
    cache: &mut TimestampSearchCache,
    target: u64,
    mode: TimestampMode,
    nary: usize,
    verbose: bool,
) -> Result<SearchOutcome, ResolveError> {
    let nary = u64::try_from(nary).unwrap_or(u64::MAX).max(2);
    let mut search = NetworkSearch {
        client,
        cache,
        fetched: Vec::new(),
    };
    let head = client.latest_block_number().await?;
    let head_ts = search.timestamp_of(head).await?;
    let genesis_ts = search.timestamp_of(0).await?;

    match mode {
        TimestampMode::Before => {
            if target < genesis_ts {
                return Err(ResolveError::OutOfRange { timestamp: target, mode });
            }
            if !is_upper(head_ts, target, mode) {
                return Ok(search.finish(head, head, Vec::new()));
            }
        }
        TimestampMode::After | TimestampMode::Equal => {
            if target > head_ts {
                return Err(ResolveError::OutOfRange { timestamp: target, mode });
            }
            if is_upper(genesis_ts, target, mode) {
                return Ok(search.finish(head, 0, Vec::new()));
            }
        }
    }

    let (mut lo, mut ts_lo) = (0, genesis_ts);
    let (mut hi, mut ts_hi) = (head, head_ts);
    for (number, timestamp) in search.cache.range(lo + 1..hi) {
        if is_upper(timestamp, target, mode) {
            (hi, ts_hi) = (number, timestamp);
            break;
        }
        (lo, ts_lo) = (number, timestamp);
    }

    let mut trail = Vec::new();
    let mut interpolate = true;
    while hi - lo > 1 {
        let width = hi - lo;
        let (probes, interpolated) = if width - 1 <= nary - 1 {
            ((lo + 1..hi).collect::<Vec<_>>(), false)
        } else if interpolate {
            (
                interpolated_probes((lo, ts_lo), (hi, ts_hi), target, nary),
                true,
            )
        } else {
            (even_probes(lo, hi, nary), false)
        };

        if verbose {
            info!(lo, hi, ?probes, interpolated, "block time search round");
            trail.push(SearchRound {
                lo,
                hi,
                probes: probes.clone(),
                interpolated,
            });
        } else {
            debug!(lo, hi, probes = probes.len(), interpolated, "block time search round");
        }

        for (number, timestamp) in search.fetch_round(&probes).await? {
            if is_upper(timestamp, target, mode) {
                (hi, ts_hi) = (number, timestamp);
                break;
            }
            (lo, ts_lo) = (number, timestamp);
        }
        interpolate = !interpolated || (hi - lo).saturating_mul(nary) <= width;
    }

    let block_number = match mode {
        TimestampMode::Before => lo,
        TimestampMode::After | TimestampMode::Equal => hi,
    };
    Ok(search.finish(head, block_number, trail))
}
