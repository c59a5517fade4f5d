//! Static trace callsites.
//!
//! Each `gtrace!` invocation owns one `static Callsite`. Entries store only
//! the callsite id; file name and format string are looked up when rendering.

use std::sync::OnceLock;

use parking_lot::RwLock;

static REGISTRY: RwLock<Vec<&'static Callsite>> = RwLock::new(Vec::new());

/// Source location and format string of one trace statement.
#[derive(Debug)]
pub struct Callsite {
    file: &'static str,
    line: u32,
    fmt: &'static str,
    id: OnceLock<u64>,
}

impl Callsite {
    /// Declares a callsite. Used by the `gtrace!` macro.
    pub const fn new(file: &'static str, line: u32, fmt: &'static str) -> Self {
        Self {
            file,
            line,
            fmt,
            id: OnceLock::new(),
        }
    }

    /// Registry id, assigned on first use.
    pub fn id(&'static self) -> u64 {
        *self.id.get_or_init(|| {
            let mut reg = REGISTRY.write();
            reg.push(self);
            reg.len() as u64
        })
    }

    /// Source file.
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Source line.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Format string.
    pub fn fmt(&self) -> &'static str {
        self.fmt
    }
}

/// Resolves a callsite id recorded in an entry. Id 0 is never assigned.
pub fn lookup(id: u64) -> Option<&'static Callsite> {
    if id == 0 {
        return None;
    }
    REGISTRY.read().get(id as usize - 1).copied()
}

/// Short file name, without directories.
pub fn short_file(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}
