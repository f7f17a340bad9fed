//! Topic filtering: bloom pre-filter plus exact topic0 matching.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use vaultbridge_core::hashing::keccak256;
use vaultbridge_core::{TOPIC_BLOOM_BITS, TOPIC_BLOOM_HASHES};

use crate::client::LogData;

/// A single topic filter: an event signature hash, optionally scoped to one
/// emitting contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    /// Topic0 (keccak256 of the event signature).
    pub hash: B256,
    /// When set, only logs emitted by this address match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Address>,
    /// Human-readable label for logs and status output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TopicFilter {
    /// An unscoped filter for a topic hash.
    pub fn new(hash: B256) -> Self {
        Self {
            hash,
            contract: None,
            description: None,
        }
    }

    /// A filter scoped to a single contract.
    pub fn scoped(hash: B256, contract: Address) -> Self {
        Self {
            hash,
            contract: Some(contract),
            description: None,
        }
    }
}

/// Small fixed-width bloom filter over lowercased topic0 strings.
///
/// 2048 bits with 3 probe positions; false positives fall through to the
/// exact set, false negatives are impossible.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TopicBloom {
    bits: Vec<u64>,
}

impl TopicBloom {
    fn new() -> Self {
        Self {
            bits: vec![0u64; TOPIC_BLOOM_BITS / 64],
        }
    }

    fn probe_positions(topic: &str) -> [usize; TOPIC_BLOOM_HASHES] {
        let mut positions = [0usize; TOPIC_BLOOM_HASHES];
        for (i, slot) in positions.iter_mut().enumerate() {
            let mut preimage = Vec::with_capacity(topic.len() + 1);
            preimage.push(i as u8);
            preimage.extend_from_slice(topic.as_bytes());
            let digest = keccak256(&preimage);
            let index = u16::from_be_bytes([digest[0], digest[1]]) as usize;
            *slot = index % TOPIC_BLOOM_BITS;
        }
        positions
    }

    fn insert(&mut self, topic: &str) {
        for pos in Self::probe_positions(topic) {
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    fn may_contain(&self, topic: &str) -> bool {
        Self::probe_positions(topic)
            .iter()
            .all(|pos| self.bits[pos / 64] & (1u64 << (pos % 64)) != 0)
    }
}

/// Matches logs against the active set of topic filters.
///
/// Holds the ordered filter list, a bloom over the lowercased topic0 set, the
/// exact set itself, and a derived contract → filters map for the
/// pre-filtering stage. The bloom is rebuilt on every mutation.
#[derive(Debug, Clone)]
pub struct TopicMatcher {
    filters: Vec<TopicFilter>,
    bloom: TopicBloom,
    exact: HashSet<String>,
    by_contract: HashMap<Address, Vec<B256>>,
}

impl TopicMatcher {
    /// An empty matcher.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            bloom: TopicBloom::new(),
            exact: HashSet::new(),
            by_contract: HashMap::new(),
        }
    }

    /// Build a matcher from an initial filter list.
    pub fn with_filters(filters: Vec<TopicFilter>) -> Self {
        let mut matcher = Self::new();
        for filter in filters {
            matcher.add(filter);
        }
        matcher
    }

    fn topic_key(topic: &B256) -> String {
        format!("{topic:#x}").to_lowercase()
    }

    /// Add a filter. Duplicate `(hash, contract)` pairs are ignored.
    pub fn add(&mut self, filter: TopicFilter) {
        let duplicate = self
            .filters
            .iter()
            .any(|f| f.hash == filter.hash && f.contract == filter.contract);
        if duplicate {
            return;
        }

        self.filters.push(filter);
        self.rebuild();
    }

    /// Remove every filter for a topic hash.
    pub fn remove(&mut self, hash: &B256) {
        self.filters.retain(|f| f.hash != *hash);
        self.rebuild();
    }

    /// Rebuild the bloom, exact set, and contract map from the filter list.
    fn rebuild(&mut self) {
        self.bloom = TopicBloom::new();
        self.exact.clear();
        self.by_contract.clear();

        for filter in &self.filters {
            let key = Self::topic_key(&filter.hash);
            self.bloom.insert(&key);
            self.exact.insert(key);
            if let Some(contract) = filter.contract {
                self.by_contract.entry(contract).or_default().push(filter.hash);
            }
        }
    }

    /// Fast pre-check: can this topic0 possibly match?
    pub fn may_match(&self, topic0: &B256) -> bool {
        self.bloom.may_contain(&Self::topic_key(topic0))
    }

    /// Exact match: returns the matched topic0 iff the log's first topic is
    /// in the set and any contract constraint on that filter is satisfied.
    pub fn match_log(&self, log: &LogData) -> Option<B256> {
        let topic0 = log.topics.first()?;

        if !self.exact.contains(&Self::topic_key(topic0)) {
            return None;
        }

        self.filters
            .iter()
            .find(|f| {
                f.hash == *topic0 && f.contract.map(|c| c == log.address).unwrap_or(true)
            })
            .map(|f| f.hash)
    }

    /// All distinct contract addresses carrying a constraint.
    pub fn constrained_contracts(&self) -> Vec<Address> {
        self.by_contract.keys().copied().collect()
    }

    /// Whether any filter is scoped to a contract.
    pub fn has_contract_constraints(&self) -> bool {
        !self.by_contract.is_empty()
    }

    /// Number of active filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the filter set is empty.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The active filters, in insertion order.
    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use vaultbridge_core::ERC721_TRANSFER_TOPIC;

    fn log(address: Address, topic0: B256) -> LogData {
        LogData {
            address,
            topics: vec![topic0],
            data: "0x".to_string(),
            log_index: 0,
        }
    }

    #[test]
    fn test_empty_matcher_matches_nothing() {
        let matcher = TopicMatcher::new();
        assert!(matcher.is_empty());
        assert!(!matcher.may_match(&ERC721_TRANSFER_TOPIC));
        assert!(matcher
            .match_log(&log(Address::ZERO, ERC721_TRANSFER_TOPIC))
            .is_none());
    }

    #[test]
    fn test_unscoped_match() {
        let matcher = TopicMatcher::with_filters(vec![TopicFilter::new(ERC721_TRANSFER_TOPIC)]);

        assert!(matcher.may_match(&ERC721_TRANSFER_TOPIC));
        let matched = matcher.match_log(&log(
            address!("1111111111111111111111111111111111111111"),
            ERC721_TRANSFER_TOPIC,
        ));
        assert_eq!(matched, Some(ERC721_TRANSFER_TOPIC));
    }

    #[test]
    fn test_contract_scoping() {
        let nft = address!("1111111111111111111111111111111111111111");
        let other = address!("2222222222222222222222222222222222222222");
        let matcher =
            TopicMatcher::with_filters(vec![TopicFilter::scoped(ERC721_TRANSFER_TOPIC, nft)]);

        assert!(matcher.has_contract_constraints());
        assert_eq!(matcher.constrained_contracts(), vec![nft]);

        assert!(matcher.match_log(&log(nft, ERC721_TRANSFER_TOPIC)).is_some());
        // Same topic from another contract does not match
        assert!(matcher
            .match_log(&log(other, ERC721_TRANSFER_TOPIC))
            .is_none());
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let matcher = TopicMatcher::with_filters(vec![TopicFilter::new(ERC721_TRANSFER_TOPIC)]);
        let unknown = b256!("00000000000000000000000000000000000000000000000000000000000000aa");

        assert!(matcher.match_log(&log(Address::ZERO, unknown)).is_none());
    }

    #[test]
    fn test_bloom_never_false_negative() {
        let mut matcher = TopicMatcher::new();
        let mut topics = Vec::new();
        for n in 1..=64u8 {
            let topic = keccak256(&[n]);
            matcher.add(TopicFilter::new(topic));
            topics.push(topic);
        }

        for topic in &topics {
            assert!(matcher.may_match(topic), "bloom must contain {topic}");
        }
    }

    #[test]
    fn test_remove_rebuilds() {
        let mut matcher = TopicMatcher::with_filters(vec![TopicFilter::new(ERC721_TRANSFER_TOPIC)]);
        assert_eq!(matcher.len(), 1);

        matcher.remove(&ERC721_TRANSFER_TOPIC);
        assert!(matcher.is_empty());
        assert!(matcher
            .match_log(&log(Address::ZERO, ERC721_TRANSFER_TOPIC))
            .is_none());
    }

    #[test]
    fn test_duplicate_filters_ignored() {
        let mut matcher = TopicMatcher::new();
        matcher.add(TopicFilter::new(ERC721_TRANSFER_TOPIC));
        matcher.add(TopicFilter::new(ERC721_TRANSFER_TOPIC));
        assert_eq!(matcher.len(), 1);

        // Same hash with a contract scope is a distinct filter
        matcher.add(TopicFilter::scoped(
            ERC721_TRANSFER_TOPIC,
            address!("1111111111111111111111111111111111111111"),
        ));
        assert_eq!(matcher.len(), 2);
    }

    #[test]
    fn test_logs_without_topics_never_match() {
        let matcher = TopicMatcher::with_filters(vec![TopicFilter::new(ERC721_TRANSFER_TOPIC)]);
        let empty = LogData {
            address: Address::ZERO,
            topics: vec![],
            data: "0x".to_string(),
            log_index: 0,
        };
        assert!(matcher.match_log(&empty).is_none());
    }
}
