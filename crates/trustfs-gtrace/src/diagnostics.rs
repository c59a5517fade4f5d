//! Request handler behind the trace diagnostics RPC.
//!
//! The transport is someone else's problem; requests and responses are plain
//! serde values and every failure maps to an errno-style status.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::TraceMode;
use crate::error::TraceError;
use crate::level::{LevelSelector, ModuleSelector};
use crate::ring::MIN_RING_SIZE;
use crate::tracer::{GTrace, TraceInfo};

/// Largest amount of text returned by `print`.
pub const MAX_PRINT_BYTES: usize = 64 * 1024;

/// A diagnostics call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DiagnosticsRequest {
    /// Write pending entries to the sinks.
    Dump,
    /// Switch mode by name (`DEFAULT`, `CONTINUOUS`, `CONTINUOUS_SHORT`).
    SetMode {
        /// Mode name, any case.
        mode: String,
    },
    /// Resize every ring.
    SetSize {
        /// New size in KB.
        kb: u32,
    },
    /// Change a module's level.
    SetLevel {
        /// Module name or `all`.
        module: String,
        /// Level name or `DEFAULT`.
        level: String,
    },
    /// Drop all buffered entries.
    Reset,
    /// Report mode, size and levels.
    Info,
    /// Return recent entries as text.
    Print {
        /// Maximum text size in KB, capped at 64.
        kb: u32,
    },
}

/// Result of a diagnostics call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DiagnosticsResponse {
    /// Success with nothing to return.
    Ok,
    /// Answer to `info`.
    Info(TraceInfo),
    /// Answer to `print`.
    Text {
        /// Rendered entries.
        text: String,
    },
    /// Failure.
    Error {
        /// Errno-style code.
        code: i32,
        /// Description.
        message: String,
    },
}

impl From<TraceError> for DiagnosticsResponse {
    fn from(e: TraceError) -> Self {
        DiagnosticsResponse::Error {
            code: e.status_code(),
            message: e.to_string(),
        }
    }
}

/// Applies `req` to `tracer`.
pub fn handle(tracer: &GTrace, req: DiagnosticsRequest) -> DiagnosticsResponse {
    match run(tracer, req) {
        Ok(resp) => resp,
        Err(e) => e.into(),
    }
}

fn run(tracer: &GTrace, req: DiagnosticsRequest) -> Result<DiagnosticsResponse, TraceError> {
    match req {
        DiagnosticsRequest::Dump => {
            tracer.dump(true)?;
            Ok(DiagnosticsResponse::Ok)
        }
        DiagnosticsRequest::SetMode { mode } => {
            let mode: TraceMode = mode.parse()?;
            tracer.set_mode(mode);
            info!(%mode, "trace mode changed");
            Ok(DiagnosticsResponse::Ok)
        }
        DiagnosticsRequest::SetSize { kb } => {
            let size = kb as usize * 1024;
            if size < MIN_RING_SIZE {
                return Err(TraceError::InvalidArgument(format!("trace size {kb}KB too small")));
            }
            tracer.resize(size)?;
            Ok(DiagnosticsResponse::Ok)
        }
        DiagnosticsRequest::SetLevel { module, level } => {
            let m: ModuleSelector = module.parse()?;
            let l: LevelSelector = level.parse()?;
            tracer.set_level(m, l);
            info!(%module, %level, "trace level changed");
            Ok(DiagnosticsResponse::Ok)
        }
        DiagnosticsRequest::Reset => {
            tracer.reset(true);
            Ok(DiagnosticsResponse::Ok)
        }
        DiagnosticsRequest::Info => Ok(DiagnosticsResponse::Info(tracer.info())),
        DiagnosticsRequest::Print { kb } => {
            let max = (kb as usize * 1024).min(MAX_PRINT_BYTES);
            Ok(DiagnosticsResponse::Text {
                text: tracer.print(max, true),
            })
        }
    }
}
