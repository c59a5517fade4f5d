//! Fixed logical CPU lanes onto which work is scheduled.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DispatchError;

/// Number of lanes, including the reserved `Unknown` lane 0.
pub const LANE_COUNT: usize = 18;

/// Logical CPU queue identifier.
///
/// Lane 0 is reserved for threads that never registered a lane. The flush
/// lanes and the compression lanes are kept contiguous so callers can iterate
/// `DB_FLUSH_FIRST..=DB_FLUSH_LAST` and `COMPRESS_FIRST..=COMPRESS_LAST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum CpuQid {
    /// Thread without a registered lane.
    #[default]
    Unknown = 0,
    /// RPC receive/reply lane.
    Rpc = 1,
    /// Secondary I/O manager lane.
    IoMgr1 = 2,
    /// Filesystem lane.
    Fs = 3,
    /// Primary I/O manager lane.
    IoMgr = 4,
    /// Table store main lane.
    DbMain = 5,
    /// Table store helper lane 1.
    DbHelper1 = 6,
    /// Table store helper lane 2.
    DbHelper2 = 7,
    /// Table store helper lane 3.
    DbHelper3 = 8,
    /// Flush lane 1.
    DbFlush1 = 9,
    /// Flush lane 2.
    DbFlush2 = 10,
    /// Flush lane 3.
    DbFlush3 = 11,
    /// Flush lane 4.
    DbFlush4 = 12,
    /// Flush lane 5.
    DbFlush5 = 13,
    /// Flush lane 6.
    DbFlush6 = 14,
    /// Compression/crypto lane 1.
    Compress1 = 15,
    /// Compression/crypto lane 2.
    Compress2 = 16,
    /// Compression/crypto lane 3.
    Compress3 = 17,
}

impl CpuQid {
    /// All lanes in index order.
    pub const ALL: [CpuQid; LANE_COUNT] = [
        CpuQid::Unknown,
        CpuQid::Rpc,
        CpuQid::IoMgr1,
        CpuQid::Fs,
        CpuQid::IoMgr,
        CpuQid::DbMain,
        CpuQid::DbHelper1,
        CpuQid::DbHelper2,
        CpuQid::DbHelper3,
        CpuQid::DbFlush1,
        CpuQid::DbFlush2,
        CpuQid::DbFlush3,
        CpuQid::DbFlush4,
        CpuQid::DbFlush5,
        CpuQid::DbFlush6,
        CpuQid::Compress1,
        CpuQid::Compress2,
        CpuQid::Compress3,
    ];

    /// First flush lane.
    pub const DB_FLUSH_FIRST: CpuQid = CpuQid::DbFlush1;
    /// Last flush lane.
    pub const DB_FLUSH_LAST: CpuQid = CpuQid::DbFlush6;
    /// First compression lane.
    pub const COMPRESS_FIRST: CpuQid = CpuQid::Compress1;
    /// Last compression lane.
    pub const COMPRESS_LAST: CpuQid = CpuQid::Compress3;

    /// Lane index into per-lane arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Looks up a lane by index.
    pub fn from_index(idx: usize) -> Result<Self, DispatchError> {
        Self::ALL
            .get(idx)
            .copied()
            .ok_or(DispatchError::InvalidLane(idx))
    }

    /// Number of compression lanes.
    pub fn compress_lane_count() -> usize {
        CpuQid::COMPRESS_LAST.index() - CpuQid::COMPRESS_FIRST.index() + 1
    }

    /// The `n`-th compression lane, wrapping around.
    pub fn compress_lane(n: usize) -> CpuQid {
        let idx = CpuQid::COMPRESS_FIRST.index() + n % Self::compress_lane_count();
        Self::ALL[idx]
    }

    /// Whether this is one of the compression lanes.
    pub fn is_compress(self) -> bool {
        self >= CpuQid::COMPRESS_FIRST && self <= CpuQid::COMPRESS_LAST
    }

    /// Whether this is one of the flush lanes.
    pub fn is_flush(self) -> bool {
        self >= CpuQid::DB_FLUSH_FIRST && self <= CpuQid::DB_FLUSH_LAST
    }

    /// Short lane name used in traces and history dumps.
    pub fn name(self) -> &'static str {
        match self {
            CpuQid::Unknown => "unknown",
            CpuQid::Rpc => "rpc",
            CpuQid::IoMgr1 => "iomgr1",
            CpuQid::Fs => "fs",
            CpuQid::IoMgr => "iomgr",
            CpuQid::DbMain => "dbmain",
            CpuQid::DbHelper1 => "dbhelper1",
            CpuQid::DbHelper2 => "dbhelper2",
            CpuQid::DbHelper3 => "dbhelper3",
            CpuQid::DbFlush1 => "dbflush1",
            CpuQid::DbFlush2 => "dbflush2",
            CpuQid::DbFlush3 => "dbflush3",
            CpuQid::DbFlush4 => "dbflush4",
            CpuQid::DbFlush5 => "dbflush5",
            CpuQid::DbFlush6 => "dbflush6",
            CpuQid::Compress1 => "compress1",
            CpuQid::Compress2 => "compress2",
            CpuQid::Compress3 => "compress3",
        }
    }
}

impl fmt::Display for CpuQid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<usize> for CpuQid {
    type Error = DispatchError;

    fn try_from(idx: usize) -> Result<Self, Self::Error> {
        CpuQid::from_index(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for (i, q) in CpuQid::ALL.iter().enumerate() {
            assert_eq!(q.index(), i);
            assert_eq!(CpuQid::from_index(i).unwrap(), *q);
        }
    }

    #[test]
    fn test_out_of_range_index() {
        assert!(matches!(
            CpuQid::from_index(LANE_COUNT),
            Err(DispatchError::InvalidLane(18))
        ));
    }

    #[test]
    fn test_lane_groups() {
        assert_eq!(CpuQid::compress_lane_count(), 3);
        assert_eq!(CpuQid::compress_lane(0), CpuQid::Compress1);
        assert_eq!(CpuQid::compress_lane(4), CpuQid::Compress2);
        assert!(CpuQid::DbFlush4.is_flush());
        assert!(!CpuQid::Rpc.is_flush());
        assert!(CpuQid::Compress3.is_compress());
        assert_eq!(
            CpuQid::DB_FLUSH_LAST.index() - CpuQid::DB_FLUSH_FIRST.index() + 1,
            6
        );
    }
}
