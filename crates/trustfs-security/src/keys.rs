//! Server keys and key types.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecurityError};

/// Size of a symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Builds a key from exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            SecurityError::InvalidArgument(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Key(arr))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key([REDACTED])")
    }
}

/// Purpose of a server key. The ordinal is stored in sealed tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum ServerKeyType {
    /// Key of the CLDB, seals user tickets.
    CldbKey = 0,
    /// Key shared by file servers.
    ServerKey = 1,
    /// Key used for tickets presented to a remote cluster.
    CldbCrossClusterKey = 2,
}

impl ServerKeyType {
    /// Every key type in ordinal order.
    pub const ALL: [ServerKeyType; 3] = [
        ServerKeyType::CldbKey,
        ServerKeyType::ServerKey,
        ServerKeyType::CldbCrossClusterKey,
    ];

    /// Looks up a key type by ordinal.
    pub fn from_u32(v: u32) -> Result<Self> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(SecurityError::UnknownKeyType(v))
    }

    /// Ordinal.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Name used in key files and logs.
    pub fn name(self) -> &'static str {
        match self {
            ServerKeyType::CldbKey => "cldb",
            ServerKeyType::ServerKey => "server",
            ServerKeyType::CldbCrossClusterKey => "cldbCrossCluster",
        }
    }
}

impl fmt::Display for ServerKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ServerKeyType {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SecurityError::InvalidArgument(format!("unknown key type '{s}'")))
    }
}
