//! Trace logger configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::TraceError;

/// Default ring size per thread (2 MiB).
pub const DEFAULT_TRACE_BUFFER_SIZE: usize = 1 << 21;
/// Default total on-disk budget for trace logs, in MB.
pub const DEFAULT_MAX_LOG_SIZE_MB: u64 = 1024;
/// Above this total budget (MB) logs are split into 2 GB files.
pub const THRESHOLD_MAX_LOG_SIZE_MB: u64 = 10 * 1024;
/// Number of files the budget is split into below the threshold.
pub const DEFAULT_NUM_OF_LOG_FILES: usize = 5;
/// Lines written between two size checks of the active log file.
pub const NUM_LINES_TO_CHECK_FILE_SIZE: usize = 10_000;

/// When entries reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TraceMode {
    /// Buffer in memory; write on dump. Errors are still written immediately.
    #[default]
    Default = 0,
    /// Also stream every entry to the sink as it is appended.
    Continuous = 1,
    /// Like `Continuous` with short timestamps and no source location.
    ContinuousShort = 2,
}

impl TraceMode {
    /// Upper-case mode name.
    pub fn name(self) -> &'static str {
        match self {
            TraceMode::Default => "DEFAULT",
            TraceMode::Continuous => "CONTINUOUS",
            TraceMode::ContinuousShort => "CONTINUOUS_SHORT",
        }
    }

    pub(crate) fn from_u8(v: u8) -> TraceMode {
        match v {
            1 => TraceMode::Continuous,
            2 => TraceMode::ContinuousShort,
            _ => TraceMode::Default,
        }
    }

    /// True for the streaming modes.
    pub fn is_continuous(self) -> bool {
        self != TraceMode::Default
    }
}

impl fmt::Display for TraceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TraceMode {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(TraceMode::Default),
            "CONTINUOUS" => Ok(TraceMode::Continuous),
            "CONTINUOUS_SHORT" => Ok(TraceMode::ContinuousShort),
            _ => Err(TraceError::InvalidArgument(format!("unknown trace mode {s}"))),
        }
    }
}

/// Configuration for [`crate::GTrace`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GTraceConfig {
    /// Ring size per thread, bytes.
    pub size: usize,
    /// Output mode.
    pub mode: TraceMode,
    /// Long-running client process: start the background flusher.
    pub is_file_client: bool,
    /// Log file; stdout when unset. With several rings each gets `<file>-<n>`.
    pub log_file: Option<PathBuf>,
    /// Total on-disk budget across rotated files, MB.
    pub max_log_size_mb: u64,
    /// Number of rings; entries go to ring `lane % thread_count`.
    pub thread_count: u8,
    /// Flusher period, seconds.
    pub flush_interval_secs: u64,
    /// Lines between two size checks of the active log file.
    pub lines_per_size_check: usize,
}

impl Default for GTraceConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_TRACE_BUFFER_SIZE,
            mode: TraceMode::Default,
            is_file_client: false,
            log_file: None,
            max_log_size_mb: DEFAULT_MAX_LOG_SIZE_MB,
            thread_count: 1,
            flush_interval_secs: 60,
            lines_per_size_check: NUM_LINES_TO_CHECK_FILE_SIZE,
        }
    }
}

impl GTraceConfig {
    /// Loads a TOML or JSON config, chosen by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Per-file size limit in bytes and number of files kept.
    pub fn log_file_limits(&self) -> (u64, usize) {
        const MB: u64 = 1024 * 1024;
        if self.max_log_size_mb > THRESHOLD_MAX_LOG_SIZE_MB {
            let files = (self.max_log_size_mb / 2048).max(1) as usize;
            (2048 * MB, files)
        } else {
            let per_file = (self.max_log_size_mb * MB / DEFAULT_NUM_OF_LOG_FILES as u64).max(1);
            (per_file, DEFAULT_NUM_OF_LOG_FILES)
        }
    }
}
