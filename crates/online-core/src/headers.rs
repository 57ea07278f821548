//! Hop-by-hop header handling.
//!
//! RFC 7230 §6.1 headers are meaningful only on a single connection and must
//! not be forwarded through the tunnel. Both the server's public listener and
//! the client forwarder apply the same filter, in both directions.

/// Headers stripped when forwarding, lowercase.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header (case-insensitive).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Drop hop-by-hop pairs, preserving the order of everything else.
pub fn strip_hop_by_hop(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("upgrade"));
        assert!(!is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn strips_while_preserving_order() {
        let pairs = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Set-Cookie".to_string(), "a=1".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Set-Cookie".to_string(), "b=2".to_string()),
        ];
        let kept = strip_hop_by_hop(pairs);
        assert_eq!(
            kept,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
            ]
        );
    }
}
