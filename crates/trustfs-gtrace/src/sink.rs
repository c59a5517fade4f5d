//! Output sink for rendered entries with size-based rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

enum Output {
    Stdout,
    File(BufWriter<File>),
}

/// Line-oriented writer: stdout, or a file rotated at a size limit.
pub struct LogSink {
    path: Option<PathBuf>,
    out: Output,
    max_file_size: u64,
    max_files: usize,
    check_every: usize,
    lines_since_check: usize,
    rotations: u64,
}

impl LogSink {
    /// Sink writing to stdout.
    pub fn stdout() -> Self {
        Self {
            path: None,
            out: Output::Stdout,
            max_file_size: u64::MAX,
            max_files: 1,
            check_every: usize::MAX,
            lines_since_check: 0,
            rotations: 0,
        }
    }

    /// Sink appending to `path`. The file is rotated once it reaches
    /// `max_file_size` bytes, keeping at most `max_files` files including the
    /// active one. Size is checked every `check_every` lines.
    pub fn open(
        path: &Path,
        max_file_size: u64,
        max_files: usize,
        check_every: usize,
    ) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            out: Output::File(BufWriter::new(file)),
            max_file_size,
            max_files: max_files.max(1),
            check_every: check_every.max(1),
            lines_since_check: 0,
            rotations: 0,
        })
    }

    /// Path of the active file, `None` for stdout.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of rotations performed.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Writes one line (a newline is appended).
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        match &mut self.out {
            Output::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            Output::File(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
                self.lines_since_check += 1;
                if self.lines_since_check >= self.check_every {
                    self.lines_since_check = 0;
                    if self.reached_limit()? {
                        self.rotate()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.out {
            Output::Stdout => io::stdout().flush(),
            Output::File(w) => w.flush(),
        }
    }

    fn reached_limit(&mut self) -> io::Result<bool> {
        match &mut self.out {
            Output::Stdout => Ok(false),
            Output::File(w) => {
                w.flush()?;
                Ok(w.get_ref().metadata()?.len() >= self.max_file_size)
            }
        }
    }

    fn rotated_name(path: &Path, n: usize) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(format!(".{n}"));
        PathBuf::from(s)
    }

    /// Renames `file` to `file.1`, shifting older files up and deleting the
    /// oldest beyond the retention count, then reopens a fresh file.
    pub fn rotate(&mut self) -> io::Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.flush()?;

        if self.max_files > 1 {
            let oldest = Self::rotated_name(&path, self.max_files - 1);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.max_files - 1).rev() {
                let from = Self::rotated_name(&path, n);
                if from.exists() {
                    fs::rename(&from, Self::rotated_name(&path, n + 1))?;
                }
            }
            fs::rename(&path, Self::rotated_name(&path, 1))?;
        } else if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to truncate trace log");
        }

        let file = File::create(&path)?;
        self.out = Output::File(BufWriter::new(file));
        self.rotations += 1;
        debug!(path = %path.display(), rotations = self.rotations, "rotated trace log");
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rotation_keeps_bounded_file_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let mut sink = LogSink::open(&path, 200, 3, 1).unwrap();
        for i in 0..100 {
            sink.write_line(&format!("line {i:04} padding padding padding")).unwrap();
        }
        sink.flush().unwrap();

        assert!(sink.rotations() > 3);
        assert!(path.exists());
        assert!(LogSink::rotated_name(&path, 1).exists());
        assert!(LogSink::rotated_name(&path, 2).exists());
        assert!(!LogSink::rotated_name(&path, 3).exists());

        let newest = fs::read_to_string(&path).unwrap();
        assert!(newest.is_empty() || newest.contains("line 0099"));
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, "old\n").unwrap();
        {
            let mut sink = LogSink::open(&path, u64::MAX, 5, 10).unwrap();
            sink.write_line("new").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
