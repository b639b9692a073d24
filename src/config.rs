//! Runtime configuration loaded from environment variables.

/// Persistence path.
pub fn data_dir() -> String {
    std::env::var("BC_DATA_DIR").unwrap_or_else(|_| "./bc_data".to_string())
}

/// HTTP port for the peer RPC surface.
pub fn port() -> u16 {
    std::env::var("BC_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9090)
}

/// Address credited as miner in assembled candidates.
pub fn miner_address() -> String {
    std::env::var("BC_MINER_ADDRESS")
        .unwrap_or_else(|_| "0x083cf8e4d9b1a1e7d4fa2d08aa0a5c4a1b2f9e62".to_string())
}

/// Opt-in persistence of full rover block data (`<chain>.block.<height>`),
/// in addition to the always-stored `<chain>.block.latest`.
pub fn persist_rover_data() -> bool {
    std::env::var("PERSIST_ROVER_DATA")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Passive mode: accept inbound peer traffic but never dial out.
pub fn p2p_passive() -> bool {
    std::env::var("BC_P2P_PASSIVE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Opt-in monitor logging.
pub fn monitor_enabled() -> bool {
    std::env::var("BC_MONITOR").is_ok()
}

/// NTP server used by the clock adjuster.
pub fn ntp_host() -> String {
    std::env::var("BC_NTP_HOST").unwrap_or_else(|_| "pool.ntp.org:123".to_string())
}

/// Static gossip peers, comma separated RPC base URLs.
pub fn gossip_peers() -> Vec<String> {
    std::env::var("BC_PEERS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Optional bootstrap peer queried for recent headers at startup.
pub fn boot_peer() -> Option<String> {
    std::env::var("BC_BOOT_PEER")
        .ok()
        .map(|s| s.trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
}

/// Disable the out-of-process miner (candidates are still assembled).
pub fn miner_disabled() -> bool {
    std::env::var("BC_MINER_DISABLED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_peers_parses_list() {
        std::env::set_var("BC_PEERS", "http://a:9090/, http://b:9090");
        let peers = gossip_peers();
        assert_eq!(peers, vec!["http://a:9090", "http://b:9090"]);
        std::env::remove_var("BC_PEERS");
    }

    #[test]
    fn defaults_without_env() {
        std::env::remove_var("BC_PORT");
        assert_eq!(port(), 9090);
        assert!(!p2p_passive());
    }
}
