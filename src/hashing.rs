//! Hash primitive used everywhere a block, header, or work string is derived.

use cryptoxide::hashing::blake2b::Blake2b;

/// Blake2b-512 of the input, hex encoded, truncated to the final 64 chars.
///
/// All block hashes, merkle roots, and work strings on the parent chain are
/// produced by this function.
pub fn blake2bl(input: &str) -> String {
    let mut context = Blake2b::<512>::new();
    context.update_mut(input.as_bytes());
    let full = hex::encode(context.finalize());
    full[64..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_64_hex_chars() {
        let h = blake2bl("hello");
        assert_eq!(h.len(), 64, "digest should be 64 chars, got {}", h.len());
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(blake2bl("abc"), blake2bl("abc"));
        assert_ne!(blake2bl("abc"), blake2bl("abd"));
    }

    #[test]
    fn empty_input_hashes() {
        let h = blake2bl("");
        assert_eq!(h.len(), 64);
    }
}
