//! Per-cluster security options parsed from cluster configuration lines.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Result, SecurityError};

/// Port used when a cluster does not set `cldbHttpsPort`.
pub const DEFAULT_CLDB_HTTPS_PORT: u16 = 7443;

/// Recognized option keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOptionKey {
    /// `secure`: wire security on.
    Secure,
    /// `cldbHttpsPort`: CLDB HTTPS port.
    CldbHttpsPort,
    /// `kerberosEnable`: Kerberos authentication on.
    KerberosEnable,
    /// `disableReplayDetection`: skip replay checks.
    DisableReplayDetection,
    /// `cldbPrincipal`: CLDB Kerberos principal.
    CldbPrincipal,
}

impl ClusterOptionKey {
    /// Every key.
    pub const ALL: [ClusterOptionKey; 5] = [
        ClusterOptionKey::Secure,
        ClusterOptionKey::CldbHttpsPort,
        ClusterOptionKey::KerberosEnable,
        ClusterOptionKey::DisableReplayDetection,
        ClusterOptionKey::CldbPrincipal,
    ];

    /// Name as written in configuration lines.
    pub fn name(self) -> &'static str {
        match self {
            ClusterOptionKey::Secure => "secure",
            ClusterOptionKey::CldbHttpsPort => "cldbHttpsPort",
            ClusterOptionKey::KerberosEnable => "kerberosEnable",
            ClusterOptionKey::DisableReplayDetection => "disableReplayDetection",
            ClusterOptionKey::CldbPrincipal => "cldbPrincipal",
        }
    }

    fn parse_value(self, raw: &str) -> Result<OptionValue> {
        let bad = || {
            SecurityError::InvalidArgument(format!("invalid value '{raw}' for {}", self.name()))
        };
        match self {
            ClusterOptionKey::Secure
            | ClusterOptionKey::KerberosEnable
            | ClusterOptionKey::DisableReplayDetection => match raw.to_ascii_lowercase().as_str() {
                "true" | "on" => Ok(OptionValue::Bool(true)),
                "false" | "off" => Ok(OptionValue::Bool(false)),
                _ => Err(bad()),
            },
            ClusterOptionKey::CldbHttpsPort => match raw.parse::<u16>() {
                Ok(p) if p > 0 => Ok(OptionValue::Int(p as i64)),
                _ => Err(bad()),
            },
            ClusterOptionKey::CldbPrincipal => {
                let ok = !raw.is_empty()
                    && raw
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "/-@._".contains(c));
                if ok {
                    Ok(OptionValue::Str(raw.to_string()))
                } else {
                    Err(bad())
                }
            }
        }
    }
}

impl FromStr for ClusterOptionKey {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SecurityError::InvalidArgument(format!("unknown cluster option '{s}'")))
    }
}

/// Typed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean option.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// String option.
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

/// Options table keyed by cluster name.
#[derive(Debug, Default)]
pub struct ClusterOptions {
    table: HashMap<String, HashMap<ClusterOptionKey, OptionValue>>,
    parsing_done: bool,
}

impl ClusterOptions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores one option, replacing a previous value.
    pub fn set_option(&mut self, cluster: &str, key: &str, value: &str) -> Result<()> {
        if cluster.is_empty() {
            return Err(SecurityError::InvalidArgument("empty cluster name".into()));
        }
        let key: ClusterOptionKey = key.parse()?;
        let value = key.parse_value(value.trim())?;
        self.table
            .entry(cluster.to_string())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    /// Stored value as text.
    pub fn get_option(&self, cluster: &str, key: &str) -> Result<String> {
        let key: ClusterOptionKey = key.parse()?;
        self.get(cluster, key)
            .map(ToString::to_string)
            .ok_or_else(|| SecurityError::NotFound(format!("{} not set for {cluster}", key.name())))
    }

    fn get(&self, cluster: &str, key: ClusterOptionKey) -> Option<&OptionValue> {
        self.table.get(cluster).and_then(|m| m.get(&key))
    }

    fn get_bool(&self, cluster: &str, key: ClusterOptionKey) -> bool {
        matches!(self.get(cluster, key), Some(OptionValue::Bool(true)))
    }

    /// `secure`, default false.
    pub fn is_security_enabled(&self, cluster: &str) -> bool {
        self.get_bool(cluster, ClusterOptionKey::Secure)
    }

    /// `kerberosEnable`, default false.
    pub fn is_kerberos_enabled(&self, cluster: &str) -> bool {
        self.get_bool(cluster, ClusterOptionKey::KerberosEnable)
    }

    /// `disableReplayDetection`, default false.
    pub fn is_replay_detection_disabled(&self, cluster: &str) -> bool {
        self.get_bool(cluster, ClusterOptionKey::DisableReplayDetection)
    }

    /// `cldbHttpsPort`, default 7443.
    pub fn cldb_https_port(&self, cluster: &str) -> u16 {
        match self.get(cluster, ClusterOptionKey::CldbHttpsPort) {
            Some(OptionValue::Int(p)) => u16::try_from(*p).unwrap_or(DEFAULT_CLDB_HTTPS_PORT),
            _ => DEFAULT_CLDB_HTTPS_PORT,
        }
    }

    /// `cldbPrincipal`.
    pub fn cldb_principal(&self, cluster: &str) -> Result<String> {
        match self.get(cluster, ClusterOptionKey::CldbPrincipal) {
            Some(OptionValue::Str(s)) => Ok(s.clone()),
            _ => Err(SecurityError::NotFound(format!("cldbPrincipal not set for {cluster}"))),
        }
    }

    /// Applies every `key=value` token of a configuration line. Tokens without
    /// `=` (hosts) are skipped. Returns the tokens that were rejected.
    pub fn process_line(&mut self, cluster: &str, line: &str) -> Vec<String> {
        let mut rejected = Vec::new();
        for token in line.split_whitespace() {
            let Some((k, v)) = token.split_once('=') else {
                continue;
            };
            if let Err(e) = self.set_option(cluster, k, v) {
                warn!(%cluster, %token, error = %e, "cluster option rejected");
                rejected.push(token.to_string());
            }
        }
        rejected
    }

    /// True once the configuration has been fully read.
    pub fn is_parsing_done(&self) -> bool {
        self.parsing_done
    }

    /// Marks the configuration as fully read.
    pub fn set_parsing_done(&mut self) {
        self.parsing_done = true;
    }
}
