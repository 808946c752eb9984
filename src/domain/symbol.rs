//! Symbol normalization: the only admissible cross-venue symbol comparison.

/// Strips exchange-specific suffixes (case-insensitively) and uppercases the
/// remainder so every venue's idea of "ETH" collapses to the same key.
///
/// Idempotent: `normalize_symbol(&normalize_symbol(s)) == normalize_symbol(s)`.
pub fn normalize_symbol(raw: &str) -> String {
    const SUFFIXES: &[&str] = &["-PERP", "USDT", "USDC", "-USD"];

    let mut s = raw.trim().to_uppercase();
    loop {
        let mut stripped = false;
        for suffix in SUFFIXES {
            if s.len() > suffix.len() && s.ends_with(suffix) {
                s.truncate(s.len() - suffix.len());
                stripped = true;
            }
        }
        if !stripped {
            break;
        }
    }
    s.retain(|c| c.is_ascii_alphabetic());
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_suffixes() {
        assert_eq!(normalize_symbol("ETH-PERP"), "ETH");
        assert_eq!(normalize_symbol("ethusdt"), "ETH");
        assert_eq!(normalize_symbol("BTCUSDC"), "BTC");
        assert_eq!(normalize_symbol("SOL-USD"), "SOL");
    }

    #[test]
    fn is_case_insensitive() {
        assert_eq!(normalize_symbol("Eth-Perp"), normalize_symbol("ETH-PERP"));
    }

    #[test]
    fn is_idempotent() {
        for raw in ["ETH-PERP", "btcusdt", "SOL-USD", "ARB"] {
            let once = normalize_symbol(raw);
            let twice = normalize_symbol(&once);
            assert_eq!(once, twice, "normalize_symbol not idempotent for {raw}");
        }
    }

    #[test]
    fn plain_ticker_is_unchanged() {
        assert_eq!(normalize_symbol("ARB"), "ARB");
    }
}
