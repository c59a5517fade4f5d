//! Text rendering of entries. Only runs at dump, print or continuous flush.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::callsite::{self, short_file};
use crate::entry::{DecodedArg, EntryHeader};

/// Process identity printed ahead of dumps.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessHeader {
    /// Host name.
    pub hostname: String,
    /// Primary IPv4 address.
    pub ip: std::net::Ipv4Addr,
    /// Service port.
    pub port: u32,
    /// Process id.
    pub pid: u32,
    /// Program name.
    pub program: String,
    /// Free-form message.
    pub custom_message: Option<String>,
    /// Start time, seconds since the epoch.
    pub start_time: u64,
}

impl ProcessHeader {
    /// Renders the header as a single line.
    pub fn render(&self) -> String {
        let mut s = format!(
            "=== {} host={} ip={} port={} pid={} started={}",
            self.program,
            self.hostname,
            self.ip,
            self.port,
            self.pid,
            format_time(self.start_time, 0, false)
        );
        if let Some(msg) = &self.custom_message {
            let _ = write!(s, " {msg}");
        }
        s
    }
}

/// Formats a timestamp, full date or time-of-day only.
pub fn format_time(secs: u64, usecs: u32, short: bool) -> String {
    match DateTime::<Utc>::from_timestamp(secs as i64, usecs.saturating_mul(1000)) {
        Some(t) if short => t.format("%H:%M:%S%.6f").to_string(),
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => format!("{secs}.{usecs:06}"),
    }
}

/// Substitutes arguments into a format string.
///
/// Supports `{}`, `{:x}` and `{:#x}`; `{{` and `}}` are escapes. Missing
/// arguments render as `?`, extra arguments are appended.
pub fn format_message(fmt: &str, args: &[DecodedArg<'_>]) -> String {
    let mut out = String::with_capacity(fmt.len() + args.len() * 8);
    let mut args = args.iter();
    let mut chars = fmt.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let Some(close) = fmt[i..].find('}') else {
                    out.push_str(&fmt[i..]);
                    break;
                };
                let spec = &fmt[i + 1..i + close];
                while let Some((j, _)) = chars.peek() {
                    if *j > i + close {
                        break;
                    }
                    chars.next();
                }
                match args.next() {
                    Some(arg) => push_arg(&mut out, spec, arg),
                    None => out.push('?'),
                }
            }
            _ => out.push(c),
        }
    }
    for extra in args {
        out.push(' ');
        push_arg(&mut out, "", extra);
    }
    out
}

fn push_arg(out: &mut String, spec: &str, arg: &DecodedArg<'_>) {
    match (arg, spec) {
        (DecodedArg::Int(v), ":x") => {
            let _ = write!(out, "{v:x}");
        }
        (DecodedArg::Int(v), ":#x") => {
            let _ = write!(out, "{v:#x}");
        }
        (DecodedArg::Int(v), _) => {
            let _ = write!(out, "{v}");
        }
        (DecodedArg::Signed(v), ":x") => {
            let _ = write!(out, "{v:x}");
        }
        (DecodedArg::Signed(v), ":#x") => {
            let _ = write!(out, "{v:#x}");
        }
        (DecodedArg::Signed(v), _) => {
            let _ = write!(out, "{v}");
        }
        (DecodedArg::Str(s), _) => out.push_str(s),
    }
}

/// Renders one entry as a log line. `short` drops the date and the source
/// location.
pub fn render_entry(hdr: &EntryHeader, args: &[DecodedArg<'_>], short: bool) -> String {
    let site = callsite::lookup(hdr.callsite);
    let msg = match site {
        Some(site) => format_message(site.fmt(), args),
        None => format_message("", args),
    };
    let ts = format_time(hdr.secs, hdr.usecs, short);
    if short {
        return format!("{ts} {} {msg}", hdr.level);
    }
    let file = site.map(|s| short_file(s.file())).unwrap_or("?");
    format!(
        "{ts} {} {} {}:{} {:#x} {msg}",
        hdr.level,
        hdr.module(),
        file,
        hdr.line,
        hdr.correlation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NO_ENTRY;
    use crate::level::{Level, Module};

    #[test]
    fn test_format_message_specs() {
        let args = [
            DecodedArg::Int(255),
            DecodedArg::Int(255),
            DecodedArg::Int(255),
            DecodedArg::Str("prod"),
        ];
        assert_eq!(
            format_message("a={} b={:x} c={:#x} cluster={} {{lit}}", &args),
            "a=255 b=ff c=0xff cluster=prod {lit}"
        );
    }

    #[test]
    fn test_signed_args_render_with_sign() {
        let args = [DecodedArg::Signed(-1), DecodedArg::Signed(-255), DecodedArg::Signed(42)];
        assert_eq!(
            format_message("a={} b={:x} c={}", &args),
            "a=-1 b=ffffffffffffff01 c=42"
        );
    }

    #[test]
    fn test_format_message_missing_and_extra() {
        assert_eq!(format_message("x={} y={}", &[DecodedArg::Int(1)]), "x=1 y=?");
        assert_eq!(
            format_message("only", &[DecodedArg::Int(1), DecodedArg::Str("s")]),
            "only 1 s"
        );
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0, 5, false), "1970-01-01 00:00:00.000005");
        assert_eq!(format_time(3661, 0, true), "01:01:01.000000");
    }

    #[test]
    fn test_render_entry_full_and_short() {
        let hdr = EntryHeader {
            level: Level::Err,
            module: Module::KeyStore as u8,
            slots: 0,
            nargs: 0,
            arg_mask: 0,
            line: 42,
            next: NO_ENTRY,
            prev: NO_ENTRY,
            secs: 0,
            usecs: 0,
            correlation: 0x10,
            callsite: 0,
        };
        let full = render_entry(&hdr, &[], false);
        assert_eq!(full, "1970-01-01 00:00:00.000000 ERROR keystore ?:42 0x10 ");
        let short = render_entry(&hdr, &[], true);
        assert_eq!(short, "00:00:00.000000 ERROR ");
    }

    #[test]
    fn test_header_render() {
        let h = ProcessHeader {
            hostname: "node1".into(),
            ip: std::net::Ipv4Addr::new(10, 0, 0, 1),
            port: 5660,
            pid: 77,
            program: "keytool".into(),
            custom_message: Some("hello".into()),
            start_time: 0,
        };
        assert_eq!(
            h.render(),
            "=== keytool host=node1 ip=10.0.0.1 port=5660 pid=77 started=1970-01-01 00:00:00.000000 hello"
        );
    }
}
