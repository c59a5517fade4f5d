//! The process-wide security engine.
//!
//! Key store, ticket store and cluster options sit behind one coarse mutex:
//! they change at administrative rates. The blacklist is read without that
//! lock through immutable snapshots. Bulk crypto may be moved to compression
//! lanes through [`Compression`].

use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};
use trustfs_dispatch::{
    current_dispatch_id, current_time_seconds, CpuQid, DispatchError, GlobalDispatch, WorkItem,
};
use trustfs_gtrace::{gtrace, GTrace, Level, Module};

use crate::blacklist::Blacklist;
use crate::cluster_options::ClusterOptions;
use crate::compression::Compression;
use crate::config::SecurityConfig;
use crate::credentials::{root_credentials, ProcessCredentials};
use crate::crypto;
use crate::error::{Result, SecurityError};
use crate::keys::{Key, ServerKeyType};
use crate::keystore::{KeyStore, TicketAndKeyStore};
use crate::ticket::{self, Credentials, Ticket, TicketAndKey};

/// Environment variable overriding the user ticket file path.
pub const TICKET_FILE_ENV: &str = "MAPR_TICKETFILE_LOCATION";

static INSTANCE: OnceLock<Arc<Security>> = OnceLock::new();

struct Stores {
    keys: KeyStore,
    tickets: TicketAndKeyStore,
    options: ClusterOptions,
}

/// Ticket issuing, validation and symmetric encryption for one process.
pub struct Security {
    config: SecurityConfig,
    dispatch: Arc<GlobalDispatch>,
    tracer: Arc<GTrace>,
    stores: Mutex<Stores>,
    blacklist: Blacklist,
    compression: Compression,
    process_creds: ProcessCredentials,
    admin_gid: AtomicU32,
    ticket_set: AtomicBool,
}

impl Security {
    /// Process-wide instance, built on first use with the default config, the
    /// global dispatcher and the global tracer.
    pub fn instance() -> &'static Arc<Security> {
        INSTANCE.get_or_init(|| {
            Arc::new(Security::new(
                SecurityConfig::default(),
                trustfs_dispatch::global().clone(),
                trustfs_gtrace::global().clone(),
            ))
        })
    }

    /// Installs `security` as the process-wide instance. Returns false if one
    /// was already built.
    pub fn install(security: Arc<Security>) -> bool {
        INSTANCE.set(security).is_ok()
    }

    /// Creates an engine with empty stores.
    pub fn new(config: SecurityConfig, dispatch: Arc<GlobalDispatch>, tracer: Arc<GTrace>) -> Self {
        crypto::set_iv_refresh_interval(config.iv_refresh_interval);
        let compression = Compression::new(
            dispatch.clone(),
            tracer.clone(),
            config.offload_threshold,
            config.crypto_lanes,
            config.compression_level,
        );
        let process_creds = ProcessCredentials::current();
        info!(
            uid = process_creds.uid,
            groups = process_creds.groups.len(),
            "security engine initialized"
        );
        Self {
            stores: Mutex::new(Stores {
                keys: KeyStore::new(config.max_key_types),
                tickets: TicketAndKeyStore::new(config.max_key_types),
                options: ClusterOptions::new(),
            }),
            admin_gid: AtomicU32::new(config.admin_gid),
            config,
            dispatch,
            tracer,
            blacklist: Blacklist::new(),
            compression,
            process_creds,
            ticket_set: AtomicBool::new(false),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Offload engine for bulk crypto and compression.
    pub fn compression(&self) -> &Compression {
        &self.compression
    }

    // Keys

    /// Replaces the server key of `key_type`.
    pub fn set_key(&self, key_type: ServerKeyType, key: &Key) -> Result<()> {
        self.stores.lock().keys.set_key(key_type, key)?;
        gtrace!(&self.tracer, Module::KeyStore, Level::Info, 0, "set {} key", key_type.name());
        Ok(())
    }

    /// Server key of `key_type`.
    pub fn get_key(&self, key_type: ServerKeyType) -> Result<Key> {
        self.stores.lock().keys.get_key(key_type)
    }

    /// Loads the server key of `key_type` from a key file.
    pub fn set_key_file(&self, key_type: ServerKeyType, path: &Path) -> Result<()> {
        self.stores.lock().keys.set_key_file(key_type, path)
    }

    /// Loads the server key of `key_type` from its default key file.
    pub fn load_server_key(&self, key_type: ServerKeyType) -> Result<()> {
        let path = self.config.key_file_path(key_type);
        self.set_key_file(key_type, &path)
    }

    // Tickets

    /// Issues a ticket sealed under the configured key of `key_type`.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_ticket_and_key(
        &self,
        key_type: ServerKeyType,
        user_name: &str,
        uid: u32,
        gids: &[u32],
        expiry_time: u64,
        max_renewal_duration: u64,
        is_external: bool,
    ) -> Result<TicketAndKey> {
        let key = self.get_key(key_type)?;
        self.generate_ticket_and_key_using_server_key(
            key_type,
            &key,
            user_name,
            uid,
            gids,
            expiry_time,
            current_time_seconds(),
            max_renewal_duration,
            is_external,
        )
    }

    /// Issues a ticket sealed under an explicit key with an explicit creation
    /// time.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_ticket_and_key_using_server_key(
        &self,
        key_type: ServerKeyType,
        key: &Key,
        user_name: &str,
        uid: u32,
        gids: &[u32],
        expiry_time: u64,
        creation_time: u64,
        max_renewal_duration: u64,
        is_external: bool,
    ) -> Result<TicketAndKey> {
        let creds = Credentials {
            uid,
            gids: gids.to_vec(),
            user_name: user_name.to_string(),
        };
        let tk = ticket::generate(
            key_type,
            key,
            creds,
            expiry_time,
            creation_time,
            max_renewal_duration,
            is_external,
        )?;
        gtrace!(
            &self.tracer,
            Module::Ticket,
            Level::Info,
            current_dispatch_id(),
            "issued {} ticket uid={} expiry={}",
            key_type.name(),
            uid,
            expiry_time
        );
        Ok(tk)
    }

    /// Reissues `in_ticket` with `new_expiry_time`, keeping its principal.
    pub fn renew_ticket_and_key(
        &self,
        key_type: ServerKeyType,
        in_ticket: &TicketAndKey,
        new_expiry_time: u64,
    ) -> Result<TicketAndKey> {
        let key = self.get_key(key_type)?;
        let old = Ticket::unseal(&in_ticket.encrypted_ticket, &key)?;
        let renewed = ticket::renew(key_type, &key, &old, new_expiry_time, current_time_seconds())
            .inspect_err(|e| {
                gtrace!(
                    &self.tracer,
                    Module::Ticket,
                    Level::Warn,
                    current_dispatch_id(),
                    "renewal refused uid={} errno={}",
                    old.creds.uid,
                    e.errno()
                );
            })?;
        Ok(renewed)
    }

    /// Key type a sealed ticket was issued under.
    pub fn get_ticket_key_type(&self, encrypted_ticket: &[u8]) -> Result<ServerKeyType> {
        ticket::peek_key_type(encrypted_ticket)
    }

    /// Unseals a ticket with the key its header names.
    pub fn decrypt_ticket(&self, encrypted_ticket: &[u8]) -> Result<Ticket> {
        let key_type = ticket::peek_key_type(encrypted_ticket)?;
        let key = self
            .get_key(key_type)
            .map_err(|_| SecurityError::UnknownKeyType(key_type.as_u32()))?;
        Ticket::unseal(encrypted_ticket, &key).inspect_err(|e| {
            gtrace!(
                &self.tracer,
                Module::Ticket,
                Level::Err,
                current_dispatch_id(),
                "ticket decrypt failed type={} len={} errno={}",
                key_type.name(),
                encrypted_ticket.len(),
                e.errno()
            );
        })
    }

    /// Unseals a ticket and rejects it when expired or blacklisted.
    pub fn validate_ticket(&self, encrypted_ticket: &[u8]) -> Result<Ticket> {
        let t = self.decrypt_ticket(encrypted_ticket)?;
        if self.is_ticket_expired(&t) {
            return Err(SecurityError::Expired(format!(
                "ticket for uid {} expired at {}",
                t.creds.uid, t.expiry_time
            )));
        }
        if self.is_ticket_blacklisted(&t) {
            gtrace!(
                &self.tracer,
                Module::Blacklist,
                Level::Warn,
                current_dispatch_id(),
                "rejected blacklisted uid={}",
                t.creds.uid
            );
            return Err(SecurityError::Expired(format!("uid {} is blacklisted", t.creds.uid)));
        }
        Ok(t)
    }

    /// Validates a ticket on the RPC lane and waits for the result.
    pub async fn decrypt_ticket_await(self: &Arc<Self>, encrypted_ticket: Vec<u8>) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let item = WorkItem::new("validate-ticket", move |_| {
            let _ = tx.send(this.validate_ticket(&encrypted_ticket));
        });
        self.dispatch.execute_at(CpuQid::Rpc, item)?;
        rx.await
            .map_err(|_| SecurityError::Dispatch(DispatchError::ShutDown))?
    }

    /// True while `tk` has not expired.
    pub fn is_ticket_and_key_usable(&self, tk: &TicketAndKey) -> bool {
        tk.is_usable(current_time_seconds())
    }

    /// True once `t` has expired.
    pub fn is_ticket_expired(&self, t: &Ticket) -> bool {
        t.is_expired(current_time_seconds())
    }

    // Ticket store

    /// Stores the ticket of `cluster`.
    pub fn set_ticket_and_key(
        &self,
        key_type: ServerKeyType,
        cluster: &str,
        tk: &TicketAndKey,
    ) -> Result<()> {
        let mut stores = self.stores.lock();
        self.ticket_set.store(true, Ordering::Release);
        stores.tickets.set(key_type, cluster, tk)
    }

    /// Ticket of `cluster`.
    pub fn get_ticket_and_key_for_cluster(
        &self,
        key_type: ServerKeyType,
        cluster: &str,
    ) -> Result<TicketAndKey> {
        self.stores.lock().tickets.get_for_cluster(key_type, cluster)
    }

    /// Ticket entry at `index` with its cluster name.
    pub fn get_ticket_and_key_entry(
        &self,
        key_type: ServerKeyType,
        index: usize,
    ) -> Result<(String, TicketAndKey)> {
        self.stores.lock().tickets.get_entry(key_type, index)
    }

    /// Loads a ticket file, replacing entries of the clusters it names.
    pub fn set_ticket_and_key_file(&self, path: &Path) -> Result<usize> {
        let stored = self.stores.lock().tickets.load_file(path, false)?;
        self.ticket_set.store(true, Ordering::Release);
        Ok(stored)
    }

    /// Adds tickets from a server ticket file for clusters not yet known.
    pub fn add_new_server_ticket_entries(&self, path: &Path) -> Result<usize> {
        self.stores.lock().tickets.load_file(path, true)
    }

    /// True once any ticket was set.
    pub fn is_ticket_set(&self) -> bool {
        self.ticket_set.load(Ordering::Acquire)
    }

    /// Path of the current user's ticket file.
    pub fn user_ticket_file_location(&self) -> PathBuf {
        if let Some(p) = std::env::var_os(TICKET_FILE_ENV) {
            return PathBuf::from(p);
        }
        let suffix = if self.config.ticket_file_suffix.is_empty() {
            self.process_creds.uid.to_string()
        } else {
            self.config.ticket_file_suffix.clone()
        };
        self.config
            .ticket_file_dir
            .join(format!("maprticket_{suffix}"))
    }

    // Blacklist

    /// True if the ticket's principal was blacklisted after the ticket chain
    /// was created.
    pub fn is_ticket_blacklisted(&self, t: &Ticket) -> bool {
        self.blacklist.is_blacklisted(t.creds.uid, t.creation_time)
    }

    /// Adds blacklist entries, or rebuilds the table from them with `reinit`.
    pub fn update_blacklisted_ae(&self, ids: &[u32], times: &[u64], reinit: bool) -> Result<()> {
        self.blacklist.update(ids, times, reinit)?;
        gtrace!(
            &self.tracer,
            Module::Blacklist,
            Level::Info,
            0,
            "blacklist update n={} reinit={} version={}",
            ids.len(),
            reinit,
            self.blacklist.version()
        );
        Ok(())
    }

    /// Removes blacklist entries.
    pub fn remove_blacklisted_ae(&self, ids: &[u32]) {
        self.blacklist.remove(ids);
    }

    /// Blacklist time of `id`.
    pub fn get_blacklist_time(&self, id: u32) -> Option<u64> {
        if trustfs_dispatch::my_qid() != CpuQid::Rpc {
            debug!(id, "blacklist time read off the RPC lane");
        }
        self.blacklist.blacklist_time(id)
    }

    // Cluster options

    /// Sets one option of `cluster`.
    pub fn set_cluster_option(&self, cluster: &str, key: &str, value: &str) -> Result<()> {
        self.stores.lock().options.set_option(cluster, key, value)
    }

    /// Option value as text.
    pub fn get_cluster_option(&self, cluster: &str, key: &str) -> Result<String> {
        self.stores.lock().options.get_option(cluster, key)
    }

    /// Applies the `key=value` tokens of a cluster configuration line.
    /// Returns the rejected tokens.
    pub fn process_cluster_line(&self, cluster: &str, line: &str) -> Vec<String> {
        let rejected = self.stores.lock().options.process_line(cluster, line);
        if !rejected.is_empty() {
            gtrace!(
                &self.tracer,
                Module::Cluster,
                Level::Warn,
                0,
                "{} options rejected for {}",
                rejected.len(),
                cluster
            );
        }
        rejected
    }

    /// `secure` for `cluster`.
    pub fn is_security_enabled(&self, cluster: &str) -> bool {
        self.stores.lock().options.is_security_enabled(cluster)
    }

    /// `kerberosEnable` for `cluster`.
    pub fn is_kerberos_enabled(&self, cluster: &str) -> bool {
        self.stores.lock().options.is_kerberos_enabled(cluster)
    }

    /// `disableReplayDetection` for `cluster`.
    pub fn is_replay_detection_disabled(&self, cluster: &str) -> bool {
        self.stores.lock().options.is_replay_detection_disabled(cluster)
    }

    /// `cldbHttpsPort` for `cluster`.
    pub fn get_cldb_https_port(&self, cluster: &str) -> u16 {
        self.stores.lock().options.cldb_https_port(cluster)
    }

    /// `cldbPrincipal` for `cluster`.
    pub fn get_cldb_principal(&self, cluster: &str) -> Result<String> {
        self.stores.lock().options.cldb_principal(cluster)
    }

    /// True once cluster configuration parsing finished. Until then a
    /// missing option is not authoritative.
    pub fn is_parsing_done(&self) -> bool {
        self.stores.lock().options.is_parsing_done()
    }

    /// Marks cluster configuration parsing as finished.
    pub fn set_parsing_done(&self) {
        self.stores.lock().options.set_parsing_done();
        debug!("cluster configuration parsing done");
    }

    // Credentials

    /// Credentials of this process.
    pub fn add_credentials(&self) -> Credentials {
        self.add_user_credentials()
    }

    /// Uid and groups of this process, effective gid first.
    pub fn add_user_credentials(&self) -> Credentials {
        self.process_creds.user_credentials()
    }

    /// Cluster administrator credentials.
    pub fn add_root_credentials(&self) -> Credentials {
        root_credentials(self.admin_gid.load(Ordering::Relaxed))
    }

    /// Sets the administrator group.
    pub fn set_admin_gid(&self, gid: u32) {
        self.admin_gid.store(gid, Ordering::Relaxed);
        info!(gid, "admin gid set");
    }

    // Crypto

    /// Envelope size for `len` plaintext bytes.
    pub fn get_encrypted_size(&self, len: usize) -> usize {
        crypto::encrypted_size(len)
    }

    /// Plaintext size inside an envelope of `len` bytes.
    pub fn get_decrypted_size(&self, len: usize) -> Result<usize> {
        crypto::decrypted_size(len)
    }

    /// Encrypts `input` into `out`.
    pub fn encrypt(&self, key: &Key, input: &[u8], out: &mut [u8]) -> Result<usize> {
        crypto::encrypt(key, input, out)
    }

    /// Decrypts `input` into `out`.
    pub fn decrypt(&self, key: &Key, input: &[u8], out: &mut [u8]) -> Result<usize> {
        crypto::decrypt(key, input, out).inspect_err(|e| {
            if matches!(e, SecurityError::AuthDecryptFailure) {
                gtrace!(
                    &self.tracer,
                    Module::Crypto,
                    Level::Err,
                    current_dispatch_id(),
                    "decrypt tag mismatch len={}",
                    input.len()
                );
            }
        })
    }

    /// Encrypts the concatenation of `inputs` into `out`.
    pub fn encrypt_vectored(&self, key: &Key, inputs: &[IoSlice<'_>], out: &mut [u8]) -> Result<usize> {
        crypto::encrypt_vectored(key, inputs, out)
    }

    /// Decrypts `input` across `outs`.
    pub fn decrypt_vectored(
        &self,
        key: &Key,
        input: &[u8],
        outs: &mut [IoSliceMut<'_>],
    ) -> Result<usize> {
        crypto::decrypt_vectored(key, input, outs)
    }

    /// Size to allocate before [`Security::encode_data_for_key_file`].
    pub fn get_encoded_length_for_key_file_data(&self, len: usize) -> usize {
        crypto::key_file_encoded_len(len)
    }

    /// Seals and encodes key data for a key file.
    pub fn encode_data_for_key_file(&self, data: &[u8], out: &mut [u8]) -> Result<usize> {
        crypto::encode_for_key_file(data, out)
    }

    /// Size to allocate before [`Security::decode_data_from_key_file`].
    pub fn get_decoded_length_for_key_file_data(&self, encoded_len: usize) -> usize {
        crypto::key_file_decoded_len(encoded_len)
    }

    /// Decodes and opens key-file data.
    pub fn decode_data_from_key_file(&self, encoded: &[u8], out: &mut [u8]) -> Result<usize> {
        crypto::decode_from_key_file(encoded, out)
    }

    /// Random 32-bit number.
    pub fn generate_random_number(&self) -> u32 {
        crypto::random_number()
    }

    /// Fills `buf` with random bytes.
    pub fn generate_random_block(&self, buf: &mut [u8]) {
        crypto::random_block(buf)
    }

    /// Fresh random key.
    pub fn generate_random_key(&self) -> Key {
        crypto::random_key()
    }

    /// Digest length. Only SHA-256 is supported.
    pub fn get_hash_len(&self) -> usize {
        crypto::HASH_LEN
    }

    /// SHA-256 of `data` into `out`.
    pub fn get_hash(&self, data: &[u8], out: &mut [u8]) -> Result<usize> {
        crypto::get_hash(data, out)
    }
}
