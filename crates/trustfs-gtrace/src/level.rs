//! Trace levels and modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TraceError;

/// Severity of a trace entry. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Level {
    /// Unrecoverable error.
    Fatal = 0,
    /// Error.
    Err = 1,
    /// Warning.
    Warn = 2,
    /// Informational.
    Info = 3,
    /// Debug detail.
    Debug = 4,
}

impl Level {
    /// Every level, most severe first.
    pub const ALL: [Level; 5] = [Level::Fatal, Level::Err, Level::Warn, Level::Info, Level::Debug];

    /// Upper-case level name.
    pub fn name(self) -> &'static str {
        match self {
            Level::Fatal => "FATAL",
            Level::Err => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }

    /// Decodes a stored level byte, clamping unknown values to `Debug`.
    pub fn from_u8(v: u8) -> Level {
        Level::ALL.get(v as usize).copied().unwrap_or(Level::Debug)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Level {
    type Err = TraceError;

    // `Self::Err` would collide with the `Err` variant.
    fn from_str(s: &str) -> Result<Self, TraceError> {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "FATAL" => Ok(Level::Fatal),
            "ERROR" | "ERR" => Ok(Level::Err),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            _ => Err(TraceError::UnknownLevel(s.to_string())),
        }
    }
}

/// Number of trace modules.
pub const MODULE_COUNT: usize = 12;

/// Subsystem a trace entry belongs to. Each module has its own level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Module {
    /// Catch-all.
    Global = 0,
    /// RPC layer.
    Rpc = 1,
    /// Cooperative dispatcher.
    Dispatch = 2,
    /// Security façade.
    Security = 3,
    /// Server key store.
    KeyStore = 4,
    /// Tickets and ticket files.
    Ticket = 5,
    /// Revoked authentication entities.
    Blacklist = 6,
    /// Symmetric encryption.
    Crypto = 7,
    /// Compression codecs.
    Compress = 8,
    /// Cluster options.
    Cluster = 9,
    /// Client library.
    Client = 10,
    /// The tracer itself.
    Trace = 11,
}

impl Module {
    /// Every module in id order.
    pub const ALL: [Module; MODULE_COUNT] = [
        Module::Global,
        Module::Rpc,
        Module::Dispatch,
        Module::Security,
        Module::KeyStore,
        Module::Ticket,
        Module::Blacklist,
        Module::Crypto,
        Module::Compress,
        Module::Cluster,
        Module::Client,
        Module::Trace,
    ];

    /// Module id used as array index and in entry headers.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Decodes a stored module byte.
    pub fn from_u8(v: u8) -> Option<Module> {
        Module::ALL.get(v as usize).copied()
    }

    /// Lower-case module name.
    pub fn name(self) -> &'static str {
        match self {
            Module::Global => "global",
            Module::Rpc => "rpc",
            Module::Dispatch => "dispatch",
            Module::Security => "security",
            Module::KeyStore => "keystore",
            Module::Ticket => "ticket",
            Module::Blacklist => "blacklist",
            Module::Crypto => "crypto",
            Module::Compress => "compress",
            Module::Cluster => "cluster",
            Module::Client => "client",
            Module::Trace => "trace",
        }
    }

    /// Level a module starts with and returns to on a `DEFAULT` reset.
    pub fn default_level(self) -> Level {
        match self {
            Module::Rpc | Module::Dispatch | Module::Compress => Level::Warn,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Module {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TraceError::UnknownModule(s.to_string()))
    }
}

/// Target of a level change: one module or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSelector {
    /// A single module.
    One(Module),
    /// Every module.
    All,
}

impl FromStr for ModuleSelector {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(ModuleSelector::All)
        } else {
            s.parse().map(ModuleSelector::One)
        }
    }
}

/// New level: explicit, or each module's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSelector {
    /// Explicit maximum level.
    Level(Level),
    /// Back to the module's default.
    Default,
}

impl FromStr for LevelSelector {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("default") {
            Ok(LevelSelector::Default)
        } else {
            s.parse().map(LevelSelector::Level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Fatal < Level::Err);
        assert!(Level::Info < Level::Debug);
        assert_eq!(Level::from_u8(3), Level::Info);
        assert_eq!(Level::from_u8(200), Level::Debug);
    }

    #[test]
    fn test_name_lookup_is_case_insensitive() {
        assert_eq!("KeyStore".parse::<Module>().unwrap(), Module::KeyStore);
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("ALL".parse::<ModuleSelector>().unwrap(), ModuleSelector::All);
        assert_eq!("Default".parse::<LevelSelector>().unwrap(), LevelSelector::Default);
        assert!(matches!(
            "nosuch".parse::<Module>(),
            Err(TraceError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_module_ids_are_dense() {
        for (i, m) in Module::ALL.iter().enumerate() {
            assert_eq!(m.index(), i);
            assert_eq!(Module::from_u8(i as u8), Some(*m));
        }
        assert_eq!(Module::from_u8(MODULE_COUNT as u8), None);
    }
}
