//! Rovered child chains and the headers a parent block bundles for them.

use serde::{Deserialize, Serialize};

/// The closed set of chains this node rovers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ChildChain {
    #[serde(rename = "btc")]
    Btc,
    #[serde(rename = "eth")]
    Eth,
    #[serde(rename = "lsk")]
    Lsk,
    #[serde(rename = "neo")]
    Neo,
    #[serde(rename = "wav")]
    Wav,
}

impl ChildChain {
    pub const ALL: [ChildChain; 5] = [
        ChildChain::Btc,
        ChildChain::Eth,
        ChildChain::Lsk,
        ChildChain::Neo,
        ChildChain::Wav,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildChain::Btc => "btc",
            ChildChain::Eth => "eth",
            ChildChain::Lsk => "lsk",
            ChildChain::Neo => "neo",
            ChildChain::Wav => "wav",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ChildChain> {
        match tag {
            "btc" => Some(ChildChain::Btc),
            "eth" => Some(ChildChain::Eth),
            "lsk" => Some(ChildChain::Lsk),
            "neo" => Some(ChildChain::Neo),
            "wav" => Some(ChildChain::Wav),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChildChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent observed tip of a child chain, as recorded inside a
/// parent block. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildHeader {
    pub chain: ChildChain,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp_ms: u64,
    pub height: u64,
    pub merkle_root: String,
    pub confirmations_in_parent: u64,
}

impl ChildHeader {
    /// Copy of this header with one more parent-chain confirmation.
    pub fn confirmed_again(&self) -> ChildHeader {
        let mut next = self.clone();
        next.confirmations_in_parent += 1;
        next
    }
}

/// Per-chain header lists carried by a parent block. A valid parent block has
/// at least one entry per chain; the first entry of each list is the most
/// recent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildHeaderMap {
    #[serde(default)]
    pub btc: Vec<ChildHeader>,
    #[serde(default)]
    pub eth: Vec<ChildHeader>,
    #[serde(default)]
    pub lsk: Vec<ChildHeader>,
    #[serde(default)]
    pub neo: Vec<ChildHeader>,
    #[serde(default)]
    pub wav: Vec<ChildHeader>,
}

impl ChildHeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, chain: ChildChain) -> &Vec<ChildHeader> {
        match chain {
            ChildChain::Btc => &self.btc,
            ChildChain::Eth => &self.eth,
            ChildChain::Lsk => &self.lsk,
            ChildChain::Neo => &self.neo,
            ChildChain::Wav => &self.wav,
        }
    }

    pub fn set_list(&mut self, chain: ChildChain, headers: Vec<ChildHeader>) {
        match chain {
            ChildChain::Btc => self.btc = headers,
            ChildChain::Eth => self.eth = headers,
            ChildChain::Lsk => self.lsk = headers,
            ChildChain::Neo => self.neo = headers,
            ChildChain::Wav => self.wav = headers,
        }
    }

    /// Most recent header for a chain, if any.
    pub fn latest(&self, chain: ChildChain) -> Option<&ChildHeader> {
        self.list(chain).first()
    }

    /// All headers in fixed chain order.
    pub fn iter_all(&self) -> impl Iterator<Item = &ChildHeader> {
        ChildChain::ALL
            .iter()
            .flat_map(move |c| self.list(*c).iter())
    }

    /// Child block hashes in fixed chain order.
    pub fn all_hashes(&self) -> Vec<String> {
        self.iter_all().map(|h| h.hash.clone()).collect()
    }

    pub fn header_count(&self) -> u64 {
        self.iter_all().count() as u64
    }

    /// Number of distinct child block hashes across every chain.
    pub fn distinct_hash_count(&self) -> usize {
        let mut set = std::collections::BTreeSet::new();
        for h in self.iter_all() {
            set.insert(h.hash.as_str());
        }
        set.len()
    }

    /// True when every chain carries at least one header.
    pub fn is_complete(&self) -> bool {
        ChildChain::ALL.iter().all(|c| !self.list(*c).is_empty())
    }
}
