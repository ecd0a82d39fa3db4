use crate::constants::CLIENT_PREFIX;
use rand::RngCore as _;
use std::fmt;

/// A 20-byte peer identity as carried in the handshake.
///
/// Ids we generate follow the Azureus convention: the client prefix,
/// then random bytes. Remote ids are arbitrary and kept verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Generates a fresh local id carrying the client prefix.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        let prefix = CLIENT_PREFIX.as_bytes();
        bytes[..prefix.len()].copy_from_slice(prefix);
        rand::rng().fill_bytes(&mut bytes[prefix.len()..]);
        Self(bytes)
    }

    /// The raw id bytes, as they go on the wire.
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }

    /// The Azureus-style client tag between the leading dashes, if the
    /// id follows that convention.
    pub fn client_tag(&self) -> Option<&str> {
        let inner = self.0.strip_prefix(b"-")?;
        let end = inner.iter().position(|&b| b == b'-')?;
        std::str::from_utf8(&inner[..end]).ok()
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // printable rendering for logs; random id bytes become dots
        for byte in &self.0 {
            let c = if byte.is_ascii_graphic() {
                *byte as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
