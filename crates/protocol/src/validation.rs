//! Session id validation

/// Length of a session id: hex of a SHA-256 digest
pub const BID_LEN: usize = 64;

/// Check that `bid` looks like an id minted by an agent.
///
/// Lookups with anything else can never succeed, so callers skip them.
pub fn is_valid_bid(bid: &str) -> bool {
    bid.len() == BID_LEN
        && bid
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bid() {
        assert!(is_valid_bid(&"ab12".repeat(16)));
    }

    #[test]
    fn test_invalid_bid() {
        assert!(!is_valid_bid(""));
        assert!(!is_valid_bid(&"AB12".repeat(16)));
        assert!(!is_valid_bid(&"ab1".repeat(21)));
        assert!(!is_valid_bid(&"zz".repeat(32)));
    }
}
