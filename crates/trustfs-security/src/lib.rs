#![warn(missing_docs)]

//! TrustFS security subsystem: server keys, sealed tickets, AES-256-GCM
//! envelopes, the revocation blacklist, per-cluster security options and the
//! compression contract used by bulk transfers.
//!
//! [`Security`] is the process-wide façade. Small payloads are encrypted on the
//! calling thread; larger ones can be moved to compression lanes of the
//! dispatcher through [`Compression`].

pub mod blacklist;
pub mod cluster_options;
pub mod compression;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod keystore;
pub mod security;
pub mod ticket;

pub use blacklist::{AeHashTable, Blacklist, AE_HASH_BUCKETS};
pub use cluster_options::{ClusterOptionKey, ClusterOptions, OptionValue, DEFAULT_CLDB_HTTPS_PORT};
pub use compression::{
    min_compress_savings, Compression, CompressionType, OffloadOp, MIN_LEN_FOR_CTX_SWITCH,
};
pub use config::SecurityConfig;
pub use credentials::{ProcessCredentials, CLUSTER_ADMIN_UID};
pub use crypto::{decrypted_size, encrypted_size, ENCRYPTION_OVERHEAD, IV_SIZE, TAG_SIZE};
pub use error::{Result, SecurityError};
pub use keys::{Key, ServerKeyType, KEY_SIZE};
pub use keystore::{KeyFileRecord, KeyStore, TicketAndKeyStore};
pub use security::{Security, TICKET_FILE_ENV};
pub use ticket::{Credentials, Ticket, TicketAndKey, MAX_EXPIRY_TIME};
