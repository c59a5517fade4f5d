#![warn(missing_docs)]

//! TrustFS trace subsystem: per-thread binary ring buffers with a module/level
//! filter, continuous streaming, size-rotated log files and a diagnostics
//! request handler.
//!
//! Entries are recorded with the [`gtrace!`] macro. Arguments are copied into a
//! fixed 48-byte header plus 8-byte slots (64-byte slots for strings); text
//! formatting happens only when entries are dumped, printed or streamed.

pub mod callsite;
pub mod config;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod level;
pub mod render;
pub mod ring;
pub mod sink;
pub mod tracer;

pub use callsite::Callsite;
pub use config::{GTraceConfig, TraceMode};
pub use diagnostics::{handle as handle_diagnostics, DiagnosticsRequest, DiagnosticsResponse};
pub use entry::{TraceArg, TraceArgs, ENTRY_HEADER_SIZE, MAX_ARGS, MAX_STR_ARGS, MAX_STR_LEN};
pub use error::{TraceError, TraceResult};
pub use level::{Level, LevelSelector, Module, ModuleSelector};
pub use render::ProcessHeader;
pub use tracer::{global, install_global, GTrace, TraceInfo};

/// Records a trace entry.
///
/// ```ignore
/// gtrace!(tracer, Module::KeyStore, Level::Info, dispatch_id, "key {} set", key_type);
/// ```
///
/// Up to 16 arguments, at most 4 of them strings. When the module's level
/// filters the entry out, the arguments are not evaluated.
#[macro_export]
macro_rules! gtrace {
    ($tracer:expr, $module:expr, $level:expr, $corr:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        static __GTRACE_SITE: $crate::Callsite = $crate::Callsite::new(file!(), line!(), $fmt);
        let __tracer: &$crate::GTrace = $tracer;
        let (__module, __level) = ($module, $level);
        if __tracer.enabled(__module, __level) {
            #[allow(unused_mut)]
            let mut __args = $crate::TraceArgs::new();
            $( __args.push($crate::TraceArg::from($arg)); )*
            __tracer.gtrace(&__GTRACE_SITE, __module, __level, $corr, &__args);
        }
    }};
}
