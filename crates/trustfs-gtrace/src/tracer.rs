//! The trace logger: rings, level filter, sinks and flusher.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trustfs_dispatch::my_qid;

use crate::callsite::Callsite;
use crate::config::{GTraceConfig, TraceMode};
use crate::entry::{DecodedArg, TraceArg, TraceArgs};
use crate::error::{TraceError, TraceResult};
use crate::level::{Level, LevelSelector, Module, ModuleSelector, MODULE_COUNT};
use crate::render::{render_entry, ProcessHeader};
use crate::ring::{EntryMeta, TraceRing, MIN_RING_SIZE};
use crate::sink::LogSink;

static GLOBAL: OnceLock<Arc<GTrace>> = OnceLock::new();

/// Installs `tracer` as the process-wide instance. Returns false if one was
/// already installed.
pub fn install_global(tracer: Arc<GTrace>) -> bool {
    GLOBAL.set(tracer).is_ok()
}

/// Process-wide tracer; a default in-memory one if none was installed.
pub fn global() -> &'static Arc<GTrace> {
    GLOBAL.get_or_init(|| Arc::new(GTrace::in_memory(GTraceConfig::default())))
}

/// Current state reported by the diagnostics `info` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    /// Mode name.
    pub mode: String,
    /// Ring size per thread, bytes.
    pub size: usize,
    /// Every level name, most severe first.
    pub levels: Vec<String>,
    /// Configured level per module.
    pub modules: Vec<(String, String)>,
}

struct Shard {
    ring: Mutex<TraceRing>,
    sink: Mutex<LogSink>,
}

struct Flusher {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

/// Structured binary trace logger.
///
/// One ring per configured thread. A ring is appended to only by the threads
/// mapped onto it, so its lock is uncontended on the append path; dump, print
/// and reset take the same lock when asked to.
pub struct GTrace {
    shards: Vec<Shard>,
    levels: [AtomicU8; MODULE_COUNT],
    mode: AtomicU8,
    size: AtomicUsize,
    header: RwLock<Option<ProcessHeader>>,
    flusher: Mutex<Option<Flusher>>,
    config: GTraceConfig,
}

fn now() -> (u64, u32) {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (d.as_secs(), d.subsec_micros())
}

fn shard_log_file(config: &GTraceConfig, idx: usize) -> Option<std::path::PathBuf> {
    let base = config.log_file.as_ref()?;
    if config.thread_count <= 1 {
        return Some(base.clone());
    }
    let mut s = base.as_os_str().to_os_string();
    s.push(format!("-{idx}"));
    Some(s.into())
}

impl GTrace {
    fn assemble(config: GTraceConfig, sinks: Vec<LogSink>) -> Self {
        let shards = sinks
            .into_iter()
            .map(|sink| Shard {
                ring: Mutex::new(TraceRing::new(config.size)),
                sink: Mutex::new(sink),
            })
            .collect();
        let levels = std::array::from_fn(|i| AtomicU8::new(Module::ALL[i].default_level() as u8));
        Self {
            shards,
            levels,
            mode: AtomicU8::new(config.mode as u8),
            size: AtomicUsize::new(config.size),
            header: RwLock::new(None),
            flusher: Mutex::new(None),
            config,
        }
    }

    /// Tracer whose sinks all go to stdout; log files in `config` are ignored.
    pub fn in_memory(config: GTraceConfig) -> Self {
        let config = GTraceConfig {
            size: config.size.max(MIN_RING_SIZE),
            ..config
        };
        let count = config.thread_count.max(1) as usize;
        let sinks = (0..count).map(|_| LogSink::stdout()).collect();
        Self::assemble(config, sinks)
    }

    /// Allocates the rings and opens the sinks. Starts the background
    /// flusher for file clients with more than one ring.
    pub fn initialize(config: GTraceConfig) -> TraceResult<Arc<Self>> {
        if config.size < MIN_RING_SIZE {
            return Err(TraceError::InvalidArgument(format!(
                "trace buffer size {} below minimum {}",
                config.size, MIN_RING_SIZE
            )));
        }
        let count = config.thread_count.max(1) as usize;
        let (max_file_size, max_files) = config.log_file_limits();
        let mut sinks = Vec::with_capacity(count);
        for idx in 0..count {
            sinks.push(match shard_log_file(&config, idx) {
                Some(path) => {
                    LogSink::open(&path, max_file_size, max_files, config.lines_per_size_check)?
                }
                None => LogSink::stdout(),
            });
        }
        let tracer = Arc::new(Self::assemble(config, sinks));
        if tracer.config.is_file_client && tracer.shards.len() > 1 {
            tracer.start_flusher(Duration::from_secs(tracer.config.flush_interval_secs.max(1)))?;
        }
        info!(
            rings = tracer.shards.len(),
            size = tracer.config.size,
            mode = %tracer.mode(),
            "trace logger initialized"
        );
        Ok(tracer)
    }

    /// Starts a thread calling `dump(true)` every `interval` until
    /// [`GTrace::shutdown`] or the tracer is dropped.
    pub fn start_flusher(self: &Arc<Self>, interval: Duration) -> TraceResult<()> {
        let mut slot = self.flusher.lock();
        if slot.is_some() {
            return Ok(());
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let weak: Weak<GTrace> = Arc::downgrade(self);
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("gtrace-flusher".into())
            .spawn(move || loop {
                {
                    let (lock, cv) = &*thread_stop;
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cv.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                let Some(tracer) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = tracer.dump(true) {
                    warn!(error = %e, "periodic trace dump failed");
                }
            })?;
        *slot = Some(Flusher {
            stop,
            handle: Some(handle),
        });
        debug!(interval_secs = interval.as_secs(), "trace flusher started");
        Ok(())
    }

    /// Stops the flusher and writes out pending entries.
    pub fn shutdown(&self) -> TraceResult<()> {
        if let Some(mut f) = self.flusher.lock().take() {
            let (lock, cv) = &*f.stop;
            *lock.lock() = true;
            cv.notify_all();
            if let Some(h) = f.handle.take() {
                let _ = h.join();
            }
        }
        self.dump(true).map(|_| ())
    }

    /// Number of rings.
    pub fn ring_count(&self) -> usize {
        self.shards.len()
    }

    /// Ring size per thread, bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Current output mode.
    pub fn mode(&self) -> TraceMode {
        TraceMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Switches the output mode.
    pub fn set_mode(&self, mode: TraceMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Maximum level traced for `module`.
    pub fn level(&self, module: Module) -> Level {
        Level::from_u8(self.levels[module.index()].load(Ordering::Relaxed))
    }

    /// Sets the maximum level for one module or all, explicit or default.
    pub fn set_level(&self, module: ModuleSelector, level: LevelSelector) {
        let apply = |m: Module| {
            let l = match level {
                LevelSelector::Level(l) => l,
                LevelSelector::Default => m.default_level(),
            };
            self.levels[m.index()].store(l as u8, Ordering::Relaxed);
        };
        match module {
            ModuleSelector::One(m) => apply(m),
            ModuleSelector::All => Module::ALL.iter().copied().for_each(apply),
        }
    }

    /// Whether an entry at `level` for `module` would be recorded.
    #[inline]
    pub fn enabled(&self, module: Module, level: Level) -> bool {
        level as u8 <= self.levels[module.index()].load(Ordering::Relaxed)
    }

    /// Sets the process header printed ahead of dumps.
    pub fn set_header(&self, header: ProcessHeader) {
        *self.header.write() = Some(header);
    }

    fn shard_index(&self) -> usize {
        if self.shards.len() == 1 {
            0
        } else {
            my_qid().index() % self.shards.len()
        }
    }

    /// Appends one entry. Filtered entries cost one comparison. Never fails:
    /// oversized entries and sink errors are dropped.
    pub fn gtrace(
        &self,
        site: &'static Callsite,
        module: Module,
        level: Level,
        correlation: u64,
        args: &TraceArgs<'_>,
    ) {
        if !self.enabled(module, level) {
            return;
        }
        let (secs, usecs) = now();
        let meta = EntryMeta {
            level,
            module: module as u8,
            line: site.line(),
            secs,
            usecs,
            correlation,
            callsite: site.id(),
        };
        let shard = &self.shards[self.shard_index()];
        let appended = shard.ring.lock().append(&meta, args);
        debug_assert!(appended, "trace entry larger than the ring");

        let mode = self.mode();
        if mode.is_continuous() || level <= Level::Err {
            let decoded: Vec<DecodedArg<'_>> = args
                .as_slice()
                .iter()
                .map(|a| match *a {
                    TraceArg::Int(v) => DecodedArg::Int(v),
                    TraceArg::Signed(v) => DecodedArg::Signed(v),
                    TraceArg::Str(s) => DecodedArg::Str(crate::entry::truncate_str(s)),
                })
                .collect();
            let header = crate::entry::EntryHeader {
                level,
                module: meta.module,
                slots: args.slots() as u8,
                nargs: args.len() as u8,
                arg_mask: 0,
                line: meta.line,
                next: crate::entry::NO_ENTRY,
                prev: crate::entry::NO_ENTRY,
                secs,
                usecs,
                correlation,
                callsite: meta.callsite,
            };
            let line = render_entry(&header, &decoded, mode == TraceMode::ContinuousShort);
            let mut sink = shard.sink.lock();
            let _ = sink.write_line(&line);
            if level <= Level::Err {
                let _ = sink.flush();
            }
        }
    }

    fn lock_ring<'a>(shard: &'a Shard, should_lock: bool) -> Option<MutexGuard<'a, TraceRing>> {
        if should_lock {
            Some(shard.ring.lock())
        } else {
            shard.ring.try_lock()
        }
    }

    /// Writes entries appended since the previous dump to each ring's sink,
    /// oldest first. With `should_lock == false` rings that are busy are
    /// skipped rather than waited for. Returns the number of lines written.
    pub fn dump(&self, should_lock: bool) -> TraceResult<usize> {
        let header = self.header.read().clone();
        let mut written = 0;
        for shard in &self.shards {
            let lines: Vec<String> = {
                let Some(mut ring) = Self::lock_ring(shard, should_lock) else {
                    continue;
                };
                ring.take_undumped()
                    .iter()
                    .map(|e| render_entry(&e.header, &e.args, false))
                    .collect()
            };
            if lines.is_empty() {
                continue;
            }
            let mut sink = shard.sink.lock();
            if let Some(h) = &header {
                sink.write_line(&h.render())?;
            }
            for line in &lines {
                sink.write_line(line)?;
            }
            sink.flush()?;
            written += lines.len();
        }
        Ok(written)
    }

    /// Renders the most recent entries of every ring, in time order, into at
    /// most `max_bytes` bytes of text. With `should_lock == false` busy rings
    /// are left out.
    pub fn print(&self, max_bytes: usize, should_lock: bool) -> String {
        let mut picked: Vec<((u64, u32, u64), String)> = Vec::new();
        for shard in &self.shards {
            let Some(ring) = Self::lock_ring(shard, should_lock) else {
                continue;
            };
            let mut budget = max_bytes;
            ring.walk_newest(|e| {
                let line = render_entry(&e.header, &e.args, false);
                if line.len() + 1 > budget {
                    return false;
                }
                budget -= line.len() + 1;
                picked.push(((e.header.secs, e.header.usecs, e.seq), line));
                true
            });
        }
        picked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = String::new();
        if let Some(h) = self.header.read().as_ref() {
            let line = h.render();
            if line.len() < max_bytes {
                out.push_str(&line);
                out.push('\n');
            }
        }
        let mut budget = max_bytes.saturating_sub(out.len());
        let mut keep = Vec::new();
        for (_, line) in picked {
            if line.len() + 1 > budget {
                break;
            }
            budget -= line.len() + 1;
            keep.push(line);
        }
        for line in keep.iter().rev() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Discards every buffered entry.
    pub fn reset(&self, should_lock: bool) {
        for shard in &self.shards {
            if let Some(mut ring) = Self::lock_ring(shard, should_lock) {
                ring.reset();
            }
        }
    }

    /// Replaces every ring with one of `new_size` bytes, carrying over the
    /// entries that still fit.
    pub fn resize(&self, new_size: usize) -> TraceResult<()> {
        if new_size < MIN_RING_SIZE {
            return Err(TraceError::InvalidArgument(format!(
                "trace buffer size {new_size} below minimum {MIN_RING_SIZE}"
            )));
        }
        for shard in &self.shards {
            let mut ring = shard.ring.lock();
            let fresh = ring.resized(new_size);
            *ring = fresh;
        }
        self.size.store(new_size, Ordering::Relaxed);
        debug!(size = new_size, "trace buffers resized");
        Ok(())
    }

    /// Entries currently buffered across all rings.
    pub fn buffered(&self) -> usize {
        self.shards.iter().map(|s| s.ring.lock().len()).sum()
    }

    /// Mode, size and levels for the diagnostics surface.
    pub fn info(&self) -> TraceInfo {
        TraceInfo {
            mode: self.mode().name().to_string(),
            size: self.size(),
            levels: Level::ALL.iter().map(|l| l.name().to_string()).collect(),
            modules: Module::ALL
                .iter()
                .map(|m| (m.name().to_string(), self.level(*m).name().to_string()))
                .collect(),
        }
    }
}

impl Drop for GTrace {
    fn drop(&mut self) {
        if let Some(f) = self.flusher.get_mut().take() {
            let (lock, cv) = &*f.stop;
            *lock.lock() = true;
            cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtrace;

    fn small() -> GTrace {
        GTrace::in_memory(GTraceConfig {
            size: 1024,
            ..Default::default()
        })
    }

    #[test]
    fn test_level_filter() {
        let t = small();
        gtrace!(&t, Module::Security, Level::Debug, 0, "filtered {}", 1u32);
        assert_eq!(t.buffered(), 0);
        gtrace!(&t, Module::Security, Level::Info, 0, "kept {}", 1u32);
        assert_eq!(t.buffered(), 1);
    }

    #[test]
    fn test_set_level_all_and_default() {
        let t = small();
        t.set_level(ModuleSelector::All, LevelSelector::Level(Level::Debug));
        assert!(Module::ALL.iter().all(|m| t.level(*m) == Level::Debug));
        t.set_level(ModuleSelector::One(Module::Rpc), LevelSelector::Default);
        assert_eq!(t.level(Module::Rpc), Level::Warn);
        assert_eq!(t.level(Module::Crypto), Level::Debug);
    }

    #[test]
    fn test_print_renders_in_time_order() {
        let t = small();
        for i in 0..3u32 {
            gtrace!(&t, Module::Global, Level::Info, 7, "step {}", i);
        }
        let text = t.print(64 * 1024, true);
        let steps: Vec<&str> = text.lines().filter_map(|l| l.split("step ").nth(1)).collect();
        assert_eq!(steps, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_signed_args_survive_ring_and_resize() {
        let t = small();
        gtrace!(&t, Module::Global, Level::Info, 0, "delta {} count {}", -1i64, 3u32);
        assert!(t.print(64 * 1024, true).contains("delta -1 count 3"));
        t.resize(4096).unwrap();
        assert!(t.print(64 * 1024, true).contains("delta -1 count 3"));
    }

    #[test]
    fn test_print_respects_byte_cap() {
        let t = small();
        for i in 0..10u32 {
            gtrace!(&t, Module::Global, Level::Info, 0, "entry {}", i);
        }
        let text = t.print(200, false);
        assert!(text.len() <= 200);
        assert!(text.contains("entry 9"));
        assert!(!text.contains("entry 0"));
    }

    #[test]
    fn test_print_skips_busy_ring_without_lock() {
        let t = small();
        gtrace!(&t, Module::Global, Level::Info, 0, "held {}", 1u32);
        {
            let _busy = t.shards[0].ring.lock();
            assert!(!t.print(64 * 1024, false).contains("held 1"));
        }
        assert!(t.print(64 * 1024, false).contains("held 1"));
    }

    #[test]
    fn test_resize_rejects_tiny_buffer() {
        let t = small();
        assert!(t.resize(16).is_err());
        assert!(t.resize(4096).is_ok());
        assert_eq!(t.size(), 4096);
    }

    #[test]
    fn test_info_lists_modules() {
        let t = small();
        t.set_mode(TraceMode::Continuous);
        let info = t.info();
        assert_eq!(info.mode, "CONTINUOUS");
        assert_eq!(info.levels.len(), 5);
        assert_eq!(info.modules.len(), MODULE_COUNT);
        assert!(info.modules.contains(&("keystore".to_string(), "INFO".to_string())));
    }
}
