//! Drive identity: 32-byte public keys and their discovery keys.
//!
//! A [`DriveKey`] names a drive everywhere in the system. It is rendered as
//! 64 lowercase hex characters in paths, listings and persisted
//! configuration. The [`DiscoveryKey`] is a one-way hash of the drive key
//! used to address network configuration without revealing the key itself.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length in bytes of a drive key.
pub const KEY_LEN: usize = 32;

/// Domain separator mixed into discovery key derivation.
const DISCOVERY_CONTEXT: &[u8] = b"drivefs/discovery";

/// Error decoding a drive key from text or bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The input was not valid hexadecimal.
    #[error("invalid hex in drive key: {0}")]
    Hex(String),

    /// The decoded key had the wrong number of bytes.
    #[error("drive key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Public key identifying a drive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriveKey([u8; KEY_LEN]);

impl DriveKey {
    /// Wraps raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Decodes a hex-encoded key.
    ///
    /// Odd-length or non-hex input is a [`KeyError::Hex`]; well-formed hex of
    /// the wrong length is a [`KeyError::Length`].
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|e| KeyError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derives the discovery key for this drive.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let digest = Sha256::new()
            .chain_update(DISCOVERY_CONTEXT)
            .chain_update(self.0)
            .finalize();
        DiscoveryKey(digest.into())
    }
}

impl fmt::Display for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "DriveKey({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for DriveKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim())
    }
}

impl Serialize for DriveKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DriveKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash of a drive key used to address its network configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryKey([u8; KEY_LEN]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({}..)", &self.to_hex()[..8])
    }
}
