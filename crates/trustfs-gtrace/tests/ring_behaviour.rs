//! End-to-end behaviour of the tracer against real log files.

use std::fs;
use std::net::Ipv4Addr;

use tempfile::tempdir;
use trustfs_dispatch::{set_my_cpu_qid, CpuQid};
use trustfs_gtrace::{gtrace, GTrace, GTraceConfig, Level, Module, ProcessHeader, TraceMode};

fn file_config(dir: &std::path::Path, size: usize) -> GTraceConfig {
    GTraceConfig {
        size,
        log_file: Some(dir.join("trace.log")),
        ..Default::default()
    }
}

#[test]
fn overflow_dump_shows_only_recent_entries() {
    let dir = tempdir().unwrap();
    let tracer = GTrace::initialize(file_config(dir.path(), 1024)).unwrap();
    // 48-byte header + one slot: 18 entries fit in 1 KiB.
    for i in 0..100u64 {
        gtrace!(&tracer, Module::Global, Level::Info, 0, "seq {}", i);
    }
    let written = tracer.dump(true).unwrap();
    assert_eq!(written, 1024 / 56);

    let text = fs::read_to_string(dir.path().join("trace.log")).unwrap();
    let seqs: Vec<u64> = text
        .lines()
        .filter_map(|l| l.rsplit("seq ").next())
        .filter_map(|s| s.parse().ok())
        .collect();
    assert_eq!(seqs.first(), Some(&(100 - written as u64)));
    assert_eq!(seqs.last(), Some(&99));
}

#[test]
fn resize_before_overflow_preserves_entries() {
    let tracer = GTrace::in_memory(GTraceConfig {
        size: 1024,
        ..Default::default()
    });
    for i in 0..10u64 {
        gtrace!(&tracer, Module::Global, Level::Info, 0, "keep {}", i);
    }
    tracer.resize(64 * 1024).unwrap();
    for i in 10..200u64 {
        gtrace!(&tracer, Module::Global, Level::Info, 0, "keep {}", i);
    }
    assert_eq!(tracer.buffered(), 200);
    let text = tracer.print(64 * 1024, true);
    assert!(text.contains("keep 0\n"));
    assert!(text.contains("keep 199\n"));
}

#[test]
fn second_dump_writes_only_new_entries_with_header() {
    let dir = tempdir().unwrap();
    let tracer = GTrace::initialize(file_config(dir.path(), 4096)).unwrap();
    tracer.set_header(ProcessHeader {
        hostname: "node7".into(),
        ip: Ipv4Addr::LOCALHOST,
        port: 5692,
        pid: 1,
        program: "trustfs-test".into(),
        custom_message: None,
        start_time: 0,
    });
    gtrace!(&tracer, Module::Ticket, Level::Info, 1, "first");
    assert_eq!(tracer.dump(true).unwrap(), 1);
    gtrace!(&tracer, Module::Ticket, Level::Info, 2, "second");
    assert_eq!(tracer.dump(false).unwrap(), 1);
    assert_eq!(tracer.dump(true).unwrap(), 0);

    let text = fs::read_to_string(dir.path().join("trace.log")).unwrap();
    assert_eq!(text.matches("=== trustfs-test host=node7").count(), 2);
    assert_eq!(text.matches(" first").count(), 1);
    assert_eq!(text.matches(" second").count(), 1);
}

#[test]
fn errors_reach_the_sink_immediately() {
    let dir = tempdir().unwrap();
    let tracer = GTrace::initialize(file_config(dir.path(), 4096)).unwrap();
    gtrace!(&tracer, Module::Crypto, Level::Err, 0, "tag mismatch on {}", "cluster-x");
    gtrace!(&tracer, Module::Crypto, Level::Info, 0, "quiet");
    let text = fs::read_to_string(dir.path().join("trace.log")).unwrap();
    assert!(text.contains("ERROR crypto"));
    assert!(text.contains("tag mismatch on cluster-x"));
    assert!(!text.contains("quiet"));
}

#[test]
fn continuous_short_mode_streams_every_entry() {
    let dir = tempdir().unwrap();
    let mut config = file_config(dir.path(), 4096);
    config.mode = TraceMode::ContinuousShort;
    let tracer = GTrace::initialize(config).unwrap();
    gtrace!(&tracer, Module::Security, Level::Info, 0, "uid={} gid={}", 1000u32, 100u32);
    // Streamed lines are buffered; a dump flushes the sink.
    tracer.shutdown().unwrap();
    let text = fs::read_to_string(dir.path().join("trace.log")).unwrap();
    let first = text.lines().next().unwrap();
    assert!(first.ends_with("INFO uid=1000 gid=100"), "{first}");
}

#[test]
fn threads_are_mapped_to_rings_by_lane() {
    let dir = tempdir().unwrap();
    let mut config = file_config(dir.path(), 4096);
    config.thread_count = 2;
    let tracer = GTrace::initialize(config).unwrap();
    assert_eq!(tracer.ring_count(), 2);

    let t = tracer.clone();
    std::thread::spawn(move || {
        set_my_cpu_qid(CpuQid::Rpc);
        gtrace!(&t, Module::Rpc, Level::Warn, 0, "odd lane");
    })
    .join()
    .unwrap();
    set_my_cpu_qid(CpuQid::IoMgr1);
    gtrace!(&tracer, Module::Rpc, Level::Warn, 0, "even lane");
    tracer.dump(true).unwrap();

    let ring0 = fs::read_to_string(dir.path().join("trace.log-0")).unwrap();
    let ring1 = fs::read_to_string(dir.path().join("trace.log-1")).unwrap();
    assert!(ring0.contains("even lane"));
    assert!(ring1.contains("odd lane"));
    set_my_cpu_qid(CpuQid::Unknown);
}
