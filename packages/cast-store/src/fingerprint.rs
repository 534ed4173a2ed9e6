// BLAKE3 content fingerprints
use crate::error::{CoreError, CoreResult};
use blake3::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

const PREFIX: &str = "blake3:";

/// Content fingerprint: the BLAKE3 digest of the raw bytes.
///
/// Two uploads share storage exactly when their fingerprints are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Hash);

impl Fingerprint {
    /// Fingerprint bytes held in memory
    pub fn compute(data: &[u8]) -> Self {
        Fingerprint(blake3::hash(data))
    }

    /// Fingerprint any reader, 16KB at a time
    pub fn from_reader<R: Read>(mut reader: R) -> CoreResult<Self> {
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 16384];

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .map_err(|e| CoreError::io("failed to read data for hashing", e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Fingerprint(hasher.finalize()))
    }

    /// Hex string without prefix
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Hex string with `blake3:` prefix
    pub fn to_string_prefixed(&self) -> String {
        format!("{}{}", PREFIX, self.to_hex())
    }

    /// Opaque content-store handle for this fingerprint.
    ///
    /// Stable for the lifetime of the content.
    pub fn physical_location(&self) -> String {
        self.to_hex()
    }

    /// Check this fingerprint against a string, with or without prefix
    pub fn verify(&self, other: &str) -> bool {
        Self::from_str(other).map(|parsed| parsed == *self).unwrap_or(false)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Lock acquisition order across fingerprints relies on this.
impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_prefixed())
    }
}

impl FromStr for Fingerprint {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let hex = s.strip_prefix(PREFIX).unwrap_or(s);

        if hex.len() != 64 {
            return Err(CoreError::InvalidFingerprint(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }

        let bytes = hex::decode(hex)
            .map_err(|e| CoreError::InvalidFingerprint(format!("{}: {}", hex, e)))?;

        let hash_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidFingerprint("decoded to wrong length".into()))?;

        Ok(Fingerprint(Hash::from(hash_bytes)))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string_prefixed())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_str(&s).map_err(serde::de::Error::custom)
    }
}
