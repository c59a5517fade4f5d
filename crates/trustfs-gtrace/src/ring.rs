//! Contiguous ring of encoded entries.
//!
//! Entries are laid out back to back and chained by header `next`/`prev`
//! offsets. An entry that would cross the end of the buffer is written at
//! offset 0 instead, after evicting whatever still lives between the write
//! cursor and the end. Writing always evicts the oldest entries first.

use crate::entry::{
    decode_payload, encode_payload, DecodedArg, EntryHeader, TraceArgs, ENTRY_HEADER_SIZE,
    NO_ENTRY,
};
use crate::level::Level;

/// Smallest ring that can hold the largest entry.
pub const MIN_RING_SIZE: usize = 1024;

/// A view of one entry while the ring is borrowed.
#[derive(Debug, Clone)]
pub struct EntryRef<'a> {
    /// Decoded header.
    pub header: EntryHeader,
    /// Decoded arguments.
    pub args: Vec<DecodedArg<'a>>,
    /// Monotonic sequence number within the ring.
    pub seq: u64,
}

/// Fields of an entry supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    /// Entry level.
    pub level: Level,
    /// Module id.
    pub module: u8,
    /// Source line.
    pub line: u32,
    /// Seconds since the epoch.
    pub secs: u64,
    /// Microseconds within the second.
    pub usecs: u32,
    /// Correlation id.
    pub correlation: u64,
    /// Callsite id.
    pub callsite: u64,
}

/// One ring buffer with its cursors.
#[derive(Debug)]
pub struct TraceRing {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    write: usize,
    count: usize,
    appended: u64,
    dumped: u64,
    dropped: u64,
}

impl TraceRing {
    /// Allocates a ring of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            head: 0,
            tail: 0,
            write: 0,
            count: 0,
            appended: 0,
            dumped: 0,
            dropped: 0,
        }
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if the ring holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Entries appended since creation or the last reset.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Entries rejected because they were larger than the ring.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Zeroes the cursors. The buffer contents are left as garbage.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.write = 0;
        self.count = 0;
        self.appended = 0;
        self.dumped = 0;
    }

    fn header_at(&self, off: usize) -> EntryHeader {
        EntryHeader::read_from(&self.buf[off..off + ENTRY_HEADER_SIZE])
    }

    fn set_next(&mut self, off: usize, next: u32) {
        self.buf[off + 12..off + 16].copy_from_slice(&next.to_le_bytes());
    }

    fn evict_head(&mut self) {
        let next = self.header_at(self.head).next;
        self.count -= 1;
        if self.count == 0 || next == NO_ENTRY {
            self.count = 0;
            self.head = self.write;
        } else {
            self.head = next as usize;
        }
    }

    /// Appends an entry, overwriting the oldest ones as needed. Returns false
    /// when the entry can never fit.
    pub fn append(&mut self, meta: &EntryMeta, args: &TraceArgs<'_>) -> bool {
        let len = args.encoded_len();
        if len > self.buf.len() {
            self.dropped += 1;
            return false;
        }

        let mut pos = self.write;
        if pos + len > self.buf.len() {
            // The tail end of the buffer is skipped; anything still there is
            // older than what sits at offset 0.
            while self.count > 0 && self.head >= pos {
                self.evict_head();
            }
            pos = 0;
        }
        while self.count > 0 && self.head >= pos && self.head < pos + len {
            self.evict_head();
        }

        let header = EntryHeader {
            level: meta.level,
            module: meta.module,
            slots: args.slots() as u8,
            nargs: args.len() as u8,
            arg_mask: 0,
            line: meta.line,
            next: NO_ENTRY,
            prev: if self.count > 0 { self.tail as u32 } else { NO_ENTRY },
            secs: meta.secs,
            usecs: meta.usecs,
            correlation: meta.correlation,
            callsite: meta.callsite,
        };
        let mask = encode_payload(args, &mut self.buf[pos + ENTRY_HEADER_SIZE..pos + len]);
        EntryHeader {
            arg_mask: mask,
            ..header
        }
        .write_to(&mut self.buf[pos..pos + ENTRY_HEADER_SIZE]);

        if self.count > 0 {
            let tail = self.tail;
            self.set_next(tail, pos as u32);
        } else {
            self.head = pos;
        }
        self.tail = pos;
        self.count += 1;
        self.write = pos + len;
        self.appended += 1;
        true
    }

    fn entry_at(&self, off: usize, seq: u64) -> EntryRef<'_> {
        let header = self.header_at(off);
        let payload = &self.buf[off + ENTRY_HEADER_SIZE..off + header.entry_len()];
        EntryRef {
            args: decode_payload(&header, payload),
            header,
            seq,
        }
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<EntryRef<'_>> {
        let mut out = Vec::with_capacity(self.count);
        let first_seq = self.appended - self.count as u64;
        let mut off = self.head;
        for i in 0..self.count {
            let e = self.entry_at(off, first_seq + i as u64);
            let next = e.header.next;
            out.push(e);
            if next == NO_ENTRY {
                break;
            }
            off = next as usize;
        }
        out
    }

    /// Walks backwards from the newest entry while `keep` returns true.
    pub fn walk_newest<'a>(&'a self, mut keep: impl FnMut(&EntryRef<'a>) -> bool) {
        let mut off = self.tail;
        let mut seq = self.appended;
        for _ in 0..self.count {
            seq -= 1;
            let e = self.entry_at(off, seq);
            let prev = e.header.prev;
            if !keep(&e) || prev == NO_ENTRY {
                break;
            }
            off = prev as usize;
        }
    }

    /// Entries not yet handed out by a previous call, oldest first. Marks
    /// them as dumped.
    pub fn take_undumped(&mut self) -> Vec<EntryRef<'_>> {
        let since = self.dumped;
        self.dumped = self.appended;
        self.entries()
            .into_iter()
            .filter(|e| e.seq >= since)
            .collect()
    }

    /// Re-encodes this ring's entries into a ring of `new_size` bytes. When
    /// the new ring is smaller only the most recent entries survive.
    pub fn resized(&self, new_size: usize) -> TraceRing {
        let mut fresh = TraceRing::new(new_size);
        for e in self.entries() {
            let mut args = TraceArgs::new();
            for a in &e.args {
                args.push(match *a {
                    DecodedArg::Int(v) => v.into(),
                    DecodedArg::Signed(v) => v.into(),
                    DecodedArg::Str(s) => s.into(),
                });
            }
            let meta = EntryMeta {
                level: e.header.level,
                module: e.header.module,
                line: e.header.line,
                secs: e.header.secs,
                usecs: e.header.usecs,
                correlation: e.header.correlation,
                callsite: e.header.callsite,
            };
            fresh.append(&meta, &args);
        }
        // Keep sequence numbers so dump bookkeeping survives the swap.
        fresh.appended = self.appended;
        fresh.dumped = self.dumped;
        fresh.dropped = self.dropped;
        fresh
    }
}
