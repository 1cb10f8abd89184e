/// Peer discovery: UDP broadcast solicitations and dial backoff.
use std::time::Duration;

use rand::Rng;

/// Prefix of the solicitation datagram, followed by the sender's name.
pub const SOLICIT_PREFIX: &str = "meshage:";

/// Backoff exponent cap: 2^7 = 128 s.
const MAX_EXPONENT: u32 = 7;

/// Build the solicitation datagram for `name`.
pub fn solicitation(name: &str) -> Vec<u8> {
    format!("{SOLICIT_PREFIX}{name}").into_bytes()
}

/// Parse a solicitation datagram, returning the soliciting node's name.
pub fn parse_solicitation(datagram: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(datagram).ok()?;
    text.strip_prefix(SOLICIT_PREFIX)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Exponential backoff with random jitter, clamped at 128 s.
#[derive(Debug, Default)]
pub struct Backoff {
    exponent: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next solicitation: uniform in [0, 2^exponent) s.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = 1u64 << self.exponent;
        if self.exponent < MAX_EXPONENT {
            self.exponent += 1;
        }
        let jitter = rand::rng().random_range(0..ceiling);
        Duration::from_secs(jitter)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.exponent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solicitation_roundtrip() {
        let datagram = solicitation("edge-controller");
        assert_eq!(parse_solicitation(&datagram).as_deref(), Some("edge-controller"));
    }

    #[test]
    fn rejects_foreign_datagrams() {
        assert!(parse_solicitation(b"hello").is_none());
        assert!(parse_solicitation(b"meshage:").is_none());
        assert!(parse_solicitation(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn backoff_is_clamped() {
        let mut backoff = Backoff::new();
        for _ in 0..32 {
            assert!(backoff.next_delay() <= Duration::from_secs(128));
        }
    }

    #[test]
    fn reset_restarts_the_ramp() {
        let mut backoff = Backoff::new();
        // First delay comes from a ceiling of 2^0 = 1 s.
        assert!(backoff.next_delay() < Duration::from_secs(1));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(1));
    }
}
