//! Server key store and per-cluster ticket store.
//!
//! Both are plain data structures. The security engine serializes access to
//! them behind one mutex; nothing here blocks.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto;
use crate::error::{Result, SecurityError};
use crate::keys::{Key, ServerKeyType};
use crate::ticket::{self, TicketAndKey};

/// One server key as stored in a key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFileRecord {
    /// Key type ordinal.
    pub key_type: u32,
    /// Key material.
    pub key: Key,
    /// Expiry time, seconds since the epoch. Zero for no expiry.
    pub expiry_time: u64,
}

impl KeyFileRecord {
    /// Encodes the record as one key-file line without the newline.
    pub fn to_key_file_line(&self) -> Result<String> {
        crypto::encode_key_file_data(&bincode::serialize(self)?)
    }

    /// Decodes one key-file line.
    pub fn from_key_file_line(line: &str) -> Result<Self> {
        let data = crypto::decode_key_file_data(line)?;
        Ok(bincode::deserialize(&data)?)
    }
}

#[derive(Debug, Clone)]
struct KeyEntry {
    key: Key,
    expiry_time: u64,
}

/// At most one live key per [`ServerKeyType`].
#[derive(Debug)]
pub struct KeyStore {
    slots: Vec<Option<KeyEntry>>,
}

impl KeyStore {
    /// Creates a store with `max_key_types` slots.
    pub fn new(max_key_types: usize) -> Self {
        Self {
            slots: vec![None; max_key_types.max(ServerKeyType::ALL.len())],
        }
    }

    fn slot(&mut self, key_type: ServerKeyType) -> Result<&mut Option<KeyEntry>> {
        self.slots
            .get_mut(key_type.as_u32() as usize)
            .ok_or(SecurityError::UnknownKeyType(key_type.as_u32()))
    }

    /// Replaces the key of `key_type`.
    pub fn set_key(&mut self, key_type: ServerKeyType, key: &Key) -> Result<()> {
        self.set_key_with_expiry(key_type, key, 0)
    }

    /// Replaces the key of `key_type` with an expiry time.
    pub fn set_key_with_expiry(
        &mut self,
        key_type: ServerKeyType,
        key: &Key,
        expiry_time: u64,
    ) -> Result<()> {
        *self.slot(key_type)? = Some(KeyEntry {
            key: key.clone(),
            expiry_time,
        });
        debug!(%key_type, expiry_time, "server key set");
        Ok(())
    }

    /// Returns a copy of the key of `key_type`.
    pub fn get_key(&self, key_type: ServerKeyType) -> Result<Key> {
        self.slots
            .get(key_type.as_u32() as usize)
            .and_then(|s| s.as_ref())
            .map(|e| e.key.clone())
            .ok_or_else(|| SecurityError::NotFound(format!("no {key_type} key configured")))
    }

    /// Expiry time of the key of `key_type`.
    pub fn key_expiry(&self, key_type: ServerKeyType) -> Result<u64> {
        self.slots
            .get(key_type.as_u32() as usize)
            .and_then(|s| s.as_ref())
            .map(|e| e.expiry_time)
            .ok_or_else(|| SecurityError::NotFound(format!("no {key_type} key configured")))
    }

    /// Loads the key of `key_type` from a key file. The file holds one record
    /// per line; the last record of the requested type wins.
    pub fn set_key_file(&mut self, key_type: ServerKeyType, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut found = None;
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = KeyFileRecord::from_key_file_line(line).map_err(|e| {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "bad key file record");
                e
            })?;
            if record.key_type == key_type.as_u32() {
                found = Some(record);
            }
        }
        let record = found.ok_or_else(|| {
            SecurityError::NotFound(format!("no {key_type} key in {}", path.display()))
        })?;
        self.set_key_with_expiry(key_type, &record.key, record.expiry_time)?;
        info!(%key_type, path = %path.display(), "server key loaded from key file");
        Ok(())
    }
}

/// Tickets by key type and cluster name, one entry per pair.
#[derive(Debug)]
pub struct TicketAndKeyStore {
    lists: Vec<Vec<(String, TicketAndKey)>>,
}

impl TicketAndKeyStore {
    /// Creates a store with `max_key_types` lists.
    pub fn new(max_key_types: usize) -> Self {
        Self {
            lists: vec![Vec::new(); max_key_types.max(ServerKeyType::ALL.len())],
        }
    }

    fn list(&self, key_type: ServerKeyType) -> Result<&Vec<(String, TicketAndKey)>> {
        self.lists
            .get(key_type.as_u32() as usize)
            .ok_or(SecurityError::UnknownKeyType(key_type.as_u32()))
    }

    /// Stores a ticket for `cluster`, replacing the payload of an existing
    /// entry in place.
    pub fn set(&mut self, key_type: ServerKeyType, cluster: &str, tk: &TicketAndKey) -> Result<()> {
        if cluster.is_empty() {
            return Err(SecurityError::InvalidArgument("empty cluster name".into()));
        }
        let list = self
            .lists
            .get_mut(key_type.as_u32() as usize)
            .ok_or(SecurityError::UnknownKeyType(key_type.as_u32()))?;
        match list.iter_mut().find(|(c, _)| c == cluster) {
            Some((_, existing)) => *existing = tk.clone(),
            None => list.push((cluster.to_string(), tk.clone())),
        }
        Ok(())
    }

    /// Ticket for `cluster`.
    pub fn get_for_cluster(&self, key_type: ServerKeyType, cluster: &str) -> Result<TicketAndKey> {
        self.list(key_type)?
            .iter()
            .find(|(c, _)| c == cluster)
            .map(|(_, tk)| tk.clone())
            .ok_or_else(|| SecurityError::NotFound(format!("no ticket for cluster {cluster}")))
    }

    /// Entry at `index` in insertion order.
    pub fn get_entry(&self, key_type: ServerKeyType, index: usize) -> Result<(String, TicketAndKey)> {
        self.list(key_type)?
            .get(index)
            .cloned()
            .ok_or_else(|| SecurityError::NotFound(format!("no ticket entry {index}")))
    }

    /// Number of entries for `key_type`.
    pub fn len(&self, key_type: ServerKeyType) -> usize {
        self.list(key_type).map(Vec::len).unwrap_or(0)
    }

    /// True if no type holds any entry.
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// Loads a ticket file. With `new_only`, clusters already present keep
    /// their ticket. Returns the number of entries stored.
    ///
    /// The whole file is parsed before anything is stored, so a bad line
    /// leaves the store untouched.
    pub fn load_file(&mut self, path: &Path, new_only: bool) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut parsed = Vec::new();
        for line in text.lines() {
            let Some((cluster, tk)) = TicketAndKey::parse_line(line)? else {
                continue;
            };
            let key_type = ticket::peek_key_type(&tk.encrypted_ticket)?;
            if cluster.is_empty() {
                return Err(SecurityError::InvalidArgument("empty cluster name".into()));
            }
            self.list(key_type)?;
            parsed.push((key_type, cluster, tk));
        }

        let mut stored = 0;
        for (key_type, cluster, tk) in parsed {
            if new_only && self.get_for_cluster(key_type, &cluster).is_ok() {
                debug!(%cluster, "ticket already present, skipping");
                continue;
            }
            self.set(key_type, &cluster, &tk)?;
            stored += 1;
        }
        info!(path = %path.display(), stored, new_only, "ticket file loaded");
        Ok(stored)
    }
}
