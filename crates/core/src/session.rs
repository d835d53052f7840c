//! RTSP session identifiers (RFC 2326 §12.37).
//!
//! Session identifiers are 32-bit values rendered as eight upper-case hex
//! characters on the wire. The RFC asks for at least eight octets chosen
//! randomly; the 32-bit space is kept for wire compatibility with existing
//! clients, with [`SessionId::generate`] drawing from the process RNG.

use std::fmt;

use rand::RngExt;

/// Opaque 32-bit session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        Self(rand::rng().random::<u32>())
    }

    /// Parse a session id from the `Session` request header.
    ///
    /// Folds leading hex digits and stops at the first non-hex character,
    /// so trailing parameters (`;timeout=60`) are ignored.
    pub fn parse(s: &str) -> Self {
        let mut id = 0u32;
        for c in s.chars() {
            match c.to_digit(16) {
                Some(d) => id = (id << 4) | d,
                None => break,
            }
        }
        Self(id)
    }

    /// Raw 32-bit value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_zero_padded_uppercase_hex() {
        assert_eq!(SessionId::from(0x1A2B).to_string(), "00001A2B");
        assert_eq!(SessionId::from(0).to_string(), "00000000");
        assert_eq!(SessionId::from(u32::MAX).to_string(), "FFFFFFFF");
    }

    #[test]
    fn round_trip_is_identity() {
        for &id in &[0u32, 1, 0xDEAD_BEEF, 0x0000_00FF, u32::MAX] {
            let s = SessionId::from(id).to_string();
            assert_eq!(SessionId::parse(&s), SessionId::from(id));
        }
    }

    #[test]
    fn parse_stops_at_non_hex() {
        assert_eq!(
            SessionId::parse("00001A2B;timeout=60"),
            SessionId::from(0x1A2B)
        );
        assert_eq!(SessionId::parse("ff zz"), SessionId::from(0xFF));
    }

    #[test]
    fn parse_accepts_both_cases() {
        assert_eq!(SessionId::parse("deadBEEF"), SessionId::from(0xDEAD_BEEF));
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
