//! Compression contract and CPU-lane offload for bulk crypto and compression.
//!
//! Payloads of at least the offload threshold run on one of the compression
//! lanes, picked round-robin by a per-source-lane call counter. The result is
//! delivered back on the caller's lane. Smaller payloads are processed inline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use trustfs_dispatch::{
    current_dispatch_id, my_qid, new_dispatch_id, CpuQid, GlobalDispatch, WorkItem, LANE_COUNT,
};
use trustfs_gtrace::{gtrace, GTrace, Level, Module};

use crate::crypto;
use crate::error::{Result, SecurityError};
use crate::keys::Key;

/// Compression block size.
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Smallest payload worth a context switch to a compression lane.
pub const MIN_LEN_FOR_CTX_SWITCH: usize = BLOCK_SIZE * 2;

/// Largest compressed size still worth keeping for `len` input bytes: the
/// codec must save at least an eighth.
pub fn min_compress_savings(len: usize) -> usize {
    len - (len >> 3)
}

/// Codec selector. The ordinal is stored alongside compressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompressionType {
    /// Stored as-is.
    Off = 31,
    /// LZ4 block with a size prefix.
    Lz4 = 2,
    /// Zstandard frame.
    Zstd = 3,
}

impl CompressionType {
    /// Looks up a codec by ordinal.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            31 => Ok(CompressionType::Off),
            2 => Ok(CompressionType::Lz4),
            3 => Ok(CompressionType::Zstd),
            other => Err(SecurityError::InvalidArgument(format!(
                "unknown compression type {other}"
            ))),
        }
    }

    /// Compresses `data`. `level` applies to zstd only.
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            CompressionType::Off => Ok(data.to_vec()),
            CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionType::Zstd => zstd::encode_all(data, level)
                .map_err(|e| SecurityError::CompressionFailed(e.to_string())),
        }
    }

    /// Decompresses `data`.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionType::Off => Ok(data.to_vec()),
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| SecurityError::DecompressionFailed(e.to_string())),
            CompressionType::Zstd => zstd::decode_all(data)
                .map_err(|e| SecurityError::DecompressionFailed(e.to_string())),
        }
    }

    /// Compresses and keeps the result only if it saves at least an eighth;
    /// otherwise returns the input tagged [`CompressionType::Off`].
    pub fn compress_if_worthwhile(self, data: &[u8], level: i32) -> Result<(CompressionType, Vec<u8>)> {
        if self == CompressionType::Off || data.is_empty() {
            return Ok((CompressionType::Off, data.to_vec()));
        }
        let out = self.compress(data, level)?;
        if out.len() > min_compress_savings(data.len()) {
            return Ok((CompressionType::Off, data.to_vec()));
        }
        Ok((self, out))
    }
}

/// Operation performed by the offload engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadOp {
    /// Seal with [`crypto::encrypt`].
    Encrypt,
    /// Open with [`crypto::decrypt`].
    Decrypt,
    /// Compress with the given codec.
    Compress(CompressionType),
    /// Decompress with the given codec.
    Decompress(CompressionType),
}

impl OffloadOp {
    fn label(self) -> &'static str {
        match self {
            OffloadOp::Encrypt => "offload-encrypt",
            OffloadOp::Decrypt => "offload-decrypt",
            OffloadOp::Compress(_) => "offload-compress",
            OffloadOp::Decompress(_) => "offload-decompress",
        }
    }
}

/// Runs CPU-heavy transforms off the calling lane.
pub struct Compression {
    dispatch: Arc<GlobalDispatch>,
    tracer: Arc<GTrace>,
    threshold: usize,
    lanes: usize,
    level: i32,
    num_calls: [AtomicU64; LANE_COUNT],
}

impl Compression {
    /// Creates an engine using the first `lanes` compression lanes.
    pub fn new(
        dispatch: Arc<GlobalDispatch>,
        tracer: Arc<GTrace>,
        threshold: usize,
        lanes: usize,
        level: i32,
    ) -> Self {
        Self {
            dispatch,
            tracer,
            threshold,
            lanes: lanes.clamp(1, CpuQid::compress_lane_count()),
            level,
            num_calls: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Payload size at which work moves to a compression lane.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Next compression lane for work coming from `src`.
    pub fn pick_lane(&self, src: CpuQid) -> CpuQid {
        let n = self.num_calls[src.index()].fetch_add(1, Ordering::Relaxed) + 1;
        CpuQid::compress_lane((n % self.lanes as u64) as usize)
    }

    /// Encrypts `data` and passes the envelope to `done`.
    pub fn encrypt<F>(&self, key: Key, data: Vec<u8>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.submit(OffloadOp::Encrypt, Some(key), data, done)
    }

    /// Decrypts `data` and passes the plaintext to `done`.
    pub fn decrypt<F>(&self, key: Key, data: Vec<u8>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.submit(OffloadOp::Decrypt, Some(key), data, done)
    }

    /// Compresses `data` and passes the result to `done`.
    pub fn compress<F>(&self, ty: CompressionType, data: Vec<u8>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.submit(OffloadOp::Compress(ty), None, data, done)
    }

    /// Decompresses `data` and passes the result to `done`.
    pub fn decompress<F>(&self, ty: CompressionType, data: Vec<u8>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.submit(OffloadOp::Decompress(ty), None, data, done)
    }

    fn submit<F>(&self, op: OffloadOp, key: Option<Key>, data: Vec<u8>, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let len = data.len();
        let level = self.level;
        let work = move || apply(op, key.as_ref(), &data, level);

        if len < self.threshold {
            done(work());
            return Ok(());
        }

        let src = match my_qid() {
            CpuQid::Unknown => CpuQid::Rpc,
            q => q,
        };
        let lane = self.pick_lane(src);
        let id = match current_dispatch_id() {
            0 => new_dispatch_id(),
            id => id,
        };
        gtrace!(
            &self.tracer,
            Module::Compress,
            Level::Debug,
            id,
            "{} {} bytes from {} to {}",
            op.label(),
            len,
            src.name(),
            lane.name()
        );

        let dispatch = self.dispatch.clone();
        let item = WorkItem::new(op.label(), move |_| {
            let result = work();
            let reply = WorkItem::new("offload-done", move |_| done(result)).with_dispatch_id(id);
            if let Err(e) = dispatch.execute_at(src, reply) {
                warn!(lane = src.name(), error = %e, "offload result dropped");
            }
        })
        .with_dispatch_id(id);
        self.dispatch.execute_at(lane, item)?;
        Ok(())
    }
}

fn apply(op: OffloadOp, key: Option<&Key>, data: &[u8], level: i32) -> Result<Vec<u8>> {
    match (op, key) {
        (OffloadOp::Encrypt, Some(k)) => crypto::encrypt_to_vec(k, data),
        (OffloadOp::Decrypt, Some(k)) => crypto::decrypt_to_vec(k, data),
        (OffloadOp::Compress(ty), _) => ty.compress(data, level),
        (OffloadOp::Decompress(ty), _) => ty.decompress(data),
        (_, None) => Err(SecurityError::InvalidArgument("crypto offload without key".into())),
    }
}
