//! Binary layout of a trace entry.
//!
//! ```text
//! offset  size  field
//!  0      1     level
//!  1      1     module
//!  2      1     payload length in 8-byte slots
//!  3      1     argument count
//!  4      4     argument kinds: bit i set when argument i is a string,
//!               bit 16 + i set when argument i is a signed integer
//!  8      4     source line
//! 12      4     next entry offset (u32::MAX when none)
//! 16      4     previous entry offset (u32::MAX when none)
//! 20      4     timestamp microseconds
//! 24      8     timestamp seconds
//! 32      8     correlation id
//! 40      8     callsite id (file and format string)
//! 48      ...   payload: 8 bytes per integer, 64 NUL-padded bytes per string
//! ```
//!
//! All multi-byte fields are little-endian.

use crate::level::{Level, Module};

/// Size of the fixed entry header.
pub const ENTRY_HEADER_SIZE: usize = 48;
/// Size of one payload slot.
pub const SLOT_SIZE: usize = 8;
/// Maximum number of arguments per entry.
pub const MAX_ARGS: usize = 16;
/// Maximum number of string arguments per entry.
pub const MAX_STR_ARGS: usize = 4;
/// Fixed, NUL-padded size of an embedded string.
pub const MAX_STR_LEN: usize = 64;
/// Largest possible encoded entry.
pub const MAX_ENTRY_SIZE: usize =
    ENTRY_HEADER_SIZE + MAX_STR_ARGS * MAX_STR_LEN + (MAX_ARGS - MAX_STR_ARGS) * SLOT_SIZE;

pub(crate) const NO_ENTRY: u32 = u32::MAX;

/// A single trace argument. Strings are borrowed until the entry is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceArg<'a> {
    /// Unsigned integer, stored in one slot.
    Int(u64),
    /// Signed integer, stored in one slot as two's complement.
    Signed(i64),
    /// Short string, truncated to [`MAX_STR_LEN`] bytes.
    Str(&'a str),
}

macro_rules! int_arg {
    ($variant:ident as $repr:ty: $($t:ty),*) => {
        $(impl From<$t> for TraceArg<'_> {
            fn from(v: $t) -> Self {
                TraceArg::$variant(v as $repr)
            }
        })*
    };
}

int_arg!(Int as u64: u8, u16, u32, u64, usize);
int_arg!(Signed as i64: i8, i16, i32, i64, isize);

/// Bit offset of the signed-integer flags within the argument mask.
pub const SIGNED_MASK_SHIFT: u32 = 16;

impl From<bool> for TraceArg<'_> {
    fn from(v: bool) -> Self {
        TraceArg::Int(v as u64)
    }
}

impl<'a> From<&'a str> for TraceArg<'a> {
    fn from(v: &'a str) -> Self {
        TraceArg::Str(v)
    }
}

impl<'a> From<&'a String> for TraceArg<'a> {
    fn from(v: &'a String) -> Self {
        TraceArg::Str(v.as_str())
    }
}

/// Fixed-capacity argument list built on the stack by `gtrace!`.
///
/// Arguments past the capacity (16 total, 4 strings) are dropped.
#[derive(Debug, Clone, Copy)]
pub struct TraceArgs<'a> {
    items: [TraceArg<'a>; MAX_ARGS],
    len: u8,
    strs: u8,
    dropped: u8,
}

impl<'a> TraceArgs<'a> {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self {
            items: [TraceArg::Int(0); MAX_ARGS],
            len: 0,
            strs: 0,
            dropped: 0,
        }
    }

    /// Adds an argument if capacity remains.
    pub fn push(&mut self, arg: TraceArg<'a>) {
        let is_str = matches!(arg, TraceArg::Str(_));
        if self.len as usize >= MAX_ARGS || (is_str && self.strs as usize >= MAX_STR_ARGS) {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.items[self.len as usize] = arg;
        self.len += 1;
        if is_str {
            self.strs += 1;
        }
    }

    /// Arguments accepted so far.
    pub fn as_slice(&self) -> &[TraceArg<'a>] {
        &self.items[..self.len as usize]
    }

    /// Number of arguments accepted.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if no argument was accepted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of arguments rejected for lack of capacity.
    pub fn dropped(&self) -> usize {
        self.dropped as usize
    }

    /// Payload size in slots.
    pub fn slots(&self) -> usize {
        self.as_slice()
            .iter()
            .map(|a| match a {
                TraceArg::Int(_) | TraceArg::Signed(_) => 1,
                TraceArg::Str(_) => MAX_STR_LEN / SLOT_SIZE,
            })
            .sum()
    }

    /// Encoded entry size for these arguments.
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.slots() * SLOT_SIZE
    }
}

impl Default for TraceArgs<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Entry level.
    pub level: Level,
    /// Module id byte; unknown ids render as `global`.
    pub module: u8,
    /// Payload length in slots.
    pub slots: u8,
    /// Argument count.
    pub nargs: u8,
    /// Bit i set when argument i is a string, bit 16 + i when it is a
    /// signed integer.
    pub arg_mask: u32,
    /// Source line.
    pub line: u32,
    /// Offset of the next entry in the ring.
    pub next: u32,
    /// Offset of the previous entry in the ring.
    pub prev: u32,
    /// Seconds since the epoch.
    pub secs: u64,
    /// Microseconds within the second.
    pub usecs: u32,
    /// Correlation id (dispatch id or thread id).
    pub correlation: u64,
    /// Callsite id.
    pub callsite: u64,
}

impl EntryHeader {
    /// Total encoded length of the entry.
    pub fn entry_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.slots as usize * SLOT_SIZE
    }

    /// Module the entry belongs to.
    pub fn module(&self) -> Module {
        Module::from_u8(self.module).unwrap_or(Module::Global)
    }

    pub(crate) fn write_to(&self, out: &mut [u8]) {
        out[0] = self.level as u8;
        out[1] = self.module;
        out[2] = self.slots;
        out[3] = self.nargs;
        out[4..8].copy_from_slice(&self.arg_mask.to_le_bytes());
        out[8..12].copy_from_slice(&self.line.to_le_bytes());
        out[12..16].copy_from_slice(&self.next.to_le_bytes());
        out[16..20].copy_from_slice(&self.prev.to_le_bytes());
        out[20..24].copy_from_slice(&self.usecs.to_le_bytes());
        out[24..32].copy_from_slice(&self.secs.to_le_bytes());
        out[32..40].copy_from_slice(&self.correlation.to_le_bytes());
        out[40..48].copy_from_slice(&self.callsite.to_le_bytes());
    }

    pub(crate) fn read_from(buf: &[u8]) -> EntryHeader {
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };
        EntryHeader {
            level: Level::from_u8(buf[0]),
            module: buf[1],
            slots: buf[2],
            nargs: buf[3],
            arg_mask: u32_at(4),
            line: u32_at(8),
            next: u32_at(12),
            prev: u32_at(16),
            usecs: u32_at(20),
            secs: u64_at(24),
            correlation: u64_at(32),
            callsite: u64_at(40),
        }
    }
}

/// Writes the payload for `args` into `out`, returning the argument mask.
pub(crate) fn encode_payload(args: &TraceArgs<'_>, out: &mut [u8]) -> u32 {
    let mut mask = 0u32;
    let mut off = 0;
    for (i, arg) in args.as_slice().iter().enumerate() {
        match arg {
            TraceArg::Int(v) => {
                out[off..off + SLOT_SIZE].copy_from_slice(&v.to_le_bytes());
                off += SLOT_SIZE;
            }
            TraceArg::Signed(v) => {
                mask |= 1 << (SIGNED_MASK_SHIFT as usize + i);
                out[off..off + SLOT_SIZE].copy_from_slice(&v.to_le_bytes());
                off += SLOT_SIZE;
            }
            TraceArg::Str(s) => {
                mask |= 1 << i;
                let bytes = truncate_str(s).as_bytes();
                let dst = &mut out[off..off + MAX_STR_LEN];
                dst.fill(0);
                dst[..bytes.len()].copy_from_slice(bytes);
                off += MAX_STR_LEN;
            }
        }
    }
    mask
}

/// A decoded argument, owning nothing beyond the ring borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedArg<'a> {
    /// Unsigned integer argument.
    Int(u64),
    /// Signed integer argument.
    Signed(i64),
    /// String argument with padding removed.
    Str(&'a str),
}

/// Decodes `nargs` arguments from a payload.
pub(crate) fn decode_payload<'a>(hdr: &EntryHeader, payload: &'a [u8]) -> Vec<DecodedArg<'a>> {
    let mut out = Vec::with_capacity(hdr.nargs as usize);
    let mut off = 0;
    for i in 0..hdr.nargs as usize {
        if hdr.arg_mask & (1 << i) != 0 {
            let Some(raw) = payload.get(off..off + MAX_STR_LEN) else {
                break;
            };
            let end = raw.iter().position(|&b| b == 0).unwrap_or(MAX_STR_LEN);
            out.push(DecodedArg::Str(std::str::from_utf8(&raw[..end]).unwrap_or("?")));
            off += MAX_STR_LEN;
        } else {
            let Some(raw) = payload.get(off..off + SLOT_SIZE) else {
                break;
            };
            let mut b = [0u8; 8];
            b.copy_from_slice(raw);
            if hdr.arg_mask & (1 << (SIGNED_MASK_SHIFT as usize + i)) != 0 {
                out.push(DecodedArg::Signed(i64::from_le_bytes(b)));
            } else {
                out.push(DecodedArg::Int(u64::from_le_bytes(b)));
            }
            off += SLOT_SIZE;
        }
    }
    out
}

/// Longest prefix of `s` that fits the string slot on a char boundary.
pub fn truncate_str(s: &str) -> &str {
    if s.len() <= MAX_STR_LEN {
        return s;
    }
    let mut end = MAX_STR_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_is_48_bytes_roundtrip() {
        let hdr = EntryHeader {
            level: Level::Warn,
            module: Module::Crypto as u8,
            slots: 3,
            nargs: 2,
            arg_mask: 0b10,
            line: 812,
            next: NO_ENTRY,
            prev: 96,
            secs: 1_760_000_000,
            usecs: 999_999,
            correlation: 0xdead_beef,
            callsite: 7,
        };
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        hdr.write_to(&mut buf);
        assert_eq!(EntryHeader::read_from(&buf), hdr);
        assert_eq!(hdr.entry_len(), 72);
    }

    #[test]
    fn test_args_capacity() {
        let mut args = TraceArgs::new();
        for i in 0..20u32 {
            args.push(i.into());
        }
        assert_eq!(args.len(), MAX_ARGS);
        assert_eq!(args.dropped(), 4);

        let mut args = TraceArgs::new();
        for _ in 0..6 {
            args.push("s".into());
        }
        assert_eq!(args.len(), MAX_STR_ARGS);
        assert_eq!(args.encoded_len(), ENTRY_HEADER_SIZE + 4 * MAX_STR_LEN);
    }

    #[test]
    fn test_long_string_truncated_on_char_boundary() {
        let s = "é".repeat(40);
        let t = truncate_str(&s);
        assert!(t.len() <= MAX_STR_LEN);
        assert_eq!(t.len(), 64);
        let s = format!("a{}", "é".repeat(40));
        assert_eq!(truncate_str(&s).len(), 63);
    }

    #[test]
    fn test_mixed_payload() {
        let mut args = TraceArgs::new();
        args.push(42u64.into());
        args.push("cluster-a".into());
        args.push((-1i64).into());
        let mut payload = vec![0u8; args.slots() * SLOT_SIZE];
        let mask = encode_payload(&args, &mut payload);
        assert_eq!(mask, 0b010 | (0b100 << SIGNED_MASK_SHIFT));
        let hdr = EntryHeader {
            level: Level::Info,
            module: 0,
            slots: args.slots() as u8,
            nargs: 3,
            arg_mask: mask,
            line: 0,
            next: NO_ENTRY,
            prev: NO_ENTRY,
            secs: 0,
            usecs: 0,
            correlation: 0,
            callsite: 0,
        };
        let decoded = decode_payload(&hdr, &payload);
        assert_eq!(
            decoded,
            vec![
                DecodedArg::Int(42),
                DecodedArg::Str("cluster-a"),
                DecodedArg::Signed(-1)
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_ints_decode(vals in prop::collection::vec(any::<u64>(), 0..=MAX_ARGS)) {
            let mut args = TraceArgs::new();
            for v in &vals {
                args.push((*v).into());
            }
            let mut payload = vec![0u8; args.slots() * SLOT_SIZE];
            let mask = encode_payload(&args, &mut payload);
            prop_assert_eq!(mask, 0);
            let hdr = EntryHeader {
                level: Level::Debug, module: 0, slots: args.slots() as u8,
                nargs: vals.len() as u8, arg_mask: 0, line: 0, next: NO_ENTRY,
                prev: NO_ENTRY, secs: 0, usecs: 0, correlation: 0, callsite: 0,
            };
            let got: Vec<u64> = decode_payload(&hdr, &payload)
                .into_iter()
                .map(|a| match a { DecodedArg::Int(v) => v, _ => 0 })
                .collect();
            prop_assert_eq!(got, vals);
        }
    }
}
