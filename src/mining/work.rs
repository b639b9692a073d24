//! Work derivation and the distance objective.

use num_bigint::BigUint;

use crate::chains::ChildHeaderMap;
use crate::hashing::blake2bl;

/// Fold-hash over the items, left to right. A single item yields its hash;
/// never called with an empty list.
pub fn merkle_root(items: &[String]) -> String {
    let mut acc: Option<String> = None;
    for item in items {
        acc = Some(match acc {
            None => blake2bl(item),
            Some(prev) => blake2bl(&format!("{}{}", prev, item)),
        });
    }
    acc.unwrap_or_default()
}

/// XOR-reduction over `H(header.hash || header.merkle_root)` of every child
/// header, starting from zero.
pub fn child_chain_root(headers: &ChildHeaderMap) -> BigUint {
    let mut acc = BigUint::from(0u8);
    for header in headers.iter_all() {
        let digest = blake2bl(&format!("{}{}", header.hash, header.merkle_root));
        let value = BigUint::parse_bytes(digest.as_bytes(), 16).unwrap_or_default();
        acc ^= value;
    }
    acc
}

/// The target string the miner measures distance against.
pub fn prepare_work(previous_hash: &str, headers: &ChildHeaderMap) -> String {
    let root = child_chain_root(headers);
    let prev = BigUint::parse_bytes(previous_hash.as_bytes(), 16).unwrap_or_default();
    blake2bl(&(root ^ prev).to_str_radix(10))
}

fn chunk_codes(s: &str) -> Vec<Vec<f64>> {
    s.as_bytes()
        .chunks(32)
        .map(|chunk| chunk.iter().map(|&b| b as f64).collect())
        .collect()
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a == b {
        return 1.0;
    }
    let n = a.len().min(b.len());
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for i in 0..n {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Mining objective: chunk both strings into 32-char ASCII-code vectors (the
/// first list reversed), pair them up, and accumulate one minus the cosine
/// similarity of each pair, scaled to an integer.
pub fn distance(a: &str, b: &str) -> BigUint {
    let a_chunks = chunk_codes(a);
    let b_chunks = chunk_codes(b);
    let sum: f64 = a_chunks
        .iter()
        .rev()
        .zip(b_chunks.iter())
        .map(|(ca, cb)| 1.0 - cosine_similarity(ca, cb))
        .sum();
    BigUint::from((sum * 1e15).floor().max(0.0) as u64)
}
