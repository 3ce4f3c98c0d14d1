//! Peer selection for synchronization
//!
//! Two decisions live here: which single peer carries the best chain, and
//! which subset of peers is worth sending sync requests to. Both compare
//! peers by advertised chain weight (total difficulty) and only trust peers
//! whose weight is within a configured percentage of the heaviest one.

use std::cmp::Ordering;

use rusty_sync_types::{PeerId, U256};

use crate::config::PeerPoolConfig;
use crate::peer::Peer;

/// Thresholds used by selection, extracted from [`PeerPoolConfig`]
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub weight_range_percent: u8,
    pub min_protocol_version: u8,
    pub preferred_protocol_version: u8,
    pub min_preferred_peers: usize,
    pub max_avg_latency_ms: u64,
    pub sync_peer_count: usize,
}

impl From<&PeerPoolConfig> for SelectionPolicy {
    fn from(config: &PeerPoolConfig) -> Self {
        Self {
            weight_range_percent: config.weight_range_percent,
            min_protocol_version: config.min_protocol_version,
            preferred_protocol_version: config.preferred_protocol_version,
            min_preferred_peers: config.min_preferred_peers,
            max_avg_latency_ms: config.max_avg_latency_ms,
            sync_peer_count: config.sync_peer_count,
        }
    }
}

/// Whether `candidate` is at least `100 - percent`% of `best`.
pub fn in_weight_range(candidate: U256, best: U256, percent: u8) -> bool {
    if candidate >= best {
        return true;
    }
    let hundred = U256::from(100u8);
    let keep = hundred - U256::from(percent.min(100));
    candidate.saturating_mul(hundred) >= best.saturating_mul(keep)
}

/// Heavier first; equal weights fall back to the smaller id so the order is total.
fn by_weight_desc(a: &Peer, b: &Peer) -> Ordering {
    b.weight().cmp(&a.weight()).then_with(|| a.id().cmp(&b.id()))
}

fn heaviest<'a>(peers: &[&'a Peer]) -> Option<&'a Peer> {
    peers.iter().copied().min_by(|a, b| by_weight_desc(a, b))
}

impl SelectionPolicy {
    fn in_range(&self, candidate: U256, best: U256) -> bool {
        in_weight_range(candidate, best, self.weight_range_percent)
    }

    /// Pick the peer carrying the best chain.
    ///
    /// Peers speaking the preferred protocol win when there are enough of them
    /// and their best is within range of the overall best. Otherwise the
    /// preferred tier still wins if its best is within range of the legacy
    /// tier's best; failing that the heaviest legacy peer is returned. The
    /// result is never below the weight range of the heaviest eligible peer.
    pub fn select_best<'a>(&self, peers: &[&'a Peer]) -> Option<&'a Peer> {
        let eligible: Vec<&Peer> =
            peers.iter().copied().filter(|p| p.info.protocol_version >= self.min_protocol_version).collect();
        let overall = heaviest(&eligible)?;

        let (preferred, legacy): (Vec<&Peer>, Vec<&Peer>) =
            eligible.iter().partition(|p| p.info.protocol_version >= self.preferred_protocol_version);

        match (heaviest(&preferred), heaviest(&legacy)) {
            (Some(best_preferred), _)
                if preferred.len() >= self.min_preferred_peers
                    && self.in_range(best_preferred.weight(), overall.weight()) =>
            {
                Some(best_preferred)
            }
            (Some(best_preferred), Some(best_legacy)) => {
                if self.in_range(best_preferred.weight(), best_legacy.weight()) {
                    Some(best_preferred)
                } else {
                    Some(best_legacy)
                }
            }
            (Some(best_preferred), None) => Some(best_preferred),
            (None, best_legacy) => best_legacy,
        }
    }

    /// Compute the subset of peers used for outbound sync requests.
    ///
    /// Takes the heaviest `sync_peer_count` peers, drops those outside the
    /// weight range of the heaviest, and orders the rest by average latency.
    pub fn select_sync_subset(&self, peers: &[&Peer]) -> Vec<PeerId> {
        let mut eligible: Vec<&Peer> = peers
            .iter()
            .copied()
            .filter(|p| p.info.protocol_version >= self.min_protocol_version)
            .filter(|p| p.stats.responses == 0 || p.stats.avg_latency_ms <= self.max_avg_latency_ms as f64)
            .collect();
        eligible.sort_by(|a, b| by_weight_desc(a, b));

        let best_weight = match eligible.first() {
            Some(peer) => peer.weight(),
            None => return Vec::new(),
        };
        eligible.truncate(self.sync_peer_count.max(1));
        eligible.retain(|p| self.in_range(p.weight(), best_weight));

        eligible.sort_by(|a, b| {
            a.stats
                .avg_latency_ms
                .partial_cmp(&b.stats.avg_latency_ms)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id().cmp(&b.id()))
        });
        eligible.into_iter().map(|p| p.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerInfo;
    use proptest::prelude::*;
    use std::time::Duration;

    fn peer(seed: u8, weight: u64, version: u8) -> Peer {
        let info = PeerInfo::new(
            PeerId([seed; 32]),
            format!("127.0.0.1:{}", 30000 + seed as u16).parse().unwrap(),
            U256::from(weight),
            [seed; 32],
            version,
        );
        Peer::new(info)
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy::from(&PeerPoolConfig::default())
    }

    #[test]
    fn test_in_weight_range() {
        assert!(in_weight_range(U256::from(80), U256::from(100), 20));
        assert!(!in_weight_range(U256::from(79), U256::from(100), 20));
        assert!(in_weight_range(U256::from(150), U256::from(100), 20));
        assert!(in_weight_range(U256::MAX, U256::MAX, 20));
    }

    #[test]
    fn test_prefers_newer_protocol_with_enough_peers() {
        let peers = vec![peer(1, 1000, 62), peer(2, 950, 63), peer(3, 900, 63), peer(4, 850, 63)];
        let refs: Vec<&Peer> = peers.iter().collect();
        assert_eq!(policy().select_best(&refs).unwrap().id(), PeerId([2; 32]));
    }

    #[test]
    fn test_falls_back_to_legacy_when_newer_tier_is_far_behind() {
        let peers = vec![peer(1, 1000, 62), peer(2, 500, 63)];
        let refs: Vec<&Peer> = peers.iter().collect();
        assert_eq!(policy().select_best(&refs).unwrap().id(), PeerId([1; 32]));
    }

    #[test]
    fn test_close_tiers_prefer_newer_protocol() {
        let peers = vec![peer(1, 1000, 62), peer(2, 850, 63)];
        let refs: Vec<&Peer> = peers.iter().collect();
        assert_eq!(policy().select_best(&refs).unwrap().id(), PeerId([2; 32]));
    }

    #[test]
    fn test_ignores_too_old_protocol() {
        let peers = vec![peer(1, 5000, 61), peer(2, 10, 62)];
        let refs: Vec<&Peer> = peers.iter().collect();
        assert_eq!(policy().select_best(&refs).unwrap().id(), PeerId([2; 32]));
        assert!(policy().select_best(&[]).is_none());
    }

    #[test]
    fn test_sync_subset_filters_by_range_and_sorts_by_latency() {
        let mut fast = peer(1, 900, 63);
        fast.stats.record_success(Duration::from_millis(10));
        let mut slow = peer(2, 1000, 63);
        slow.stats.record_success(Duration::from_millis(500));
        let stale = peer(3, 100, 63);
        let peers = vec![slow, fast, stale];
        let refs: Vec<&Peer> = peers.iter().collect();
        assert_eq!(policy().select_sync_subset(&refs), vec![PeerId([1; 32]), PeerId([2; 32])]);
    }

    proptest! {
        #[test]
        fn prop_best_peer_is_within_range_of_heaviest(
            specs in proptest::collection::vec((1u64..1_000_000, 62u8..=63), 1..12)
        ) {
            let peers: Vec<Peer> = specs
                .iter()
                .enumerate()
                .map(|(i, (w, v))| peer(i as u8, *w, *v))
                .collect();
            let refs: Vec<&Peer> = peers.iter().collect();
            let heaviest = peers.iter().map(|p| p.weight()).max().unwrap();
            let best = policy().select_best(&refs).unwrap();
            prop_assert!(in_weight_range(best.weight(), heaviest, 20));
        }
    }
}
