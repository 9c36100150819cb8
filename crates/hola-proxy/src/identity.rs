//! Rotating client identity.
//!
//! Every authentication round trip with the control plane uses a fresh
//! identity: a random version-4 UUID rendered as 32 lowercase hex
//! characters (no dashes), together with the instant it was generated.

use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};

/// Length of the random identifier in bytes (128 bits).
const IDENTITY_BYTES: usize = 16;

/// A client identifier and the instant it was generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: String,
    generated_at: DateTime<Utc>,
}

impl Identity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; IDENTITY_BYTES];
        getrandom::fill(&mut bytes).map_err(|e| ProxyError::Config(format!("RNG failure: {}", e)))?;

        // Version 4, RFC 4122 variant
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Ok(Self {
            id: hex_encode(&bytes),
            generated_at: Utc::now(),
        })
    }

    /// The opaque identifier sent to the control plane.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Hex-encode bytes to a lowercase string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        hex.push(HEX_CHARS[(byte >> 4) as usize]);
        hex.push(HEX_CHARS[(byte & 0x0f) as usize]);
    }
    hex
}

const HEX_CHARS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];
