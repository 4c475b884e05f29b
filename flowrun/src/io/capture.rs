//! Tee capture for one unit run.
//!
//! Every chunk a step writes is forwarded unmodified to the caller's console
//! (when echo is on) and appended to the unit's log artifact. The current
//! step's output is also kept in memory, bounded by `limit`, for the
//! execution artifact.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{FlowError, FlowResult};
use crate::io::storage::Storage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Shared handle to a unit's log artifact. Clones write to the same log.
#[derive(Clone)]
pub struct CaptureLog {
    inner: Arc<Mutex<CaptureInner>>,
}

struct CaptureInner {
    log: Box<dyn Write + Send>,
    echo: bool,
    limit: usize,
    step: Vec<u8>,
    step_truncated: usize,
    failed: Option<io::Error>,
}

impl CaptureLog {
    /// Truncate `path` and start capturing into it.
    pub fn open(storage: &dyn Storage, path: &Path, echo: bool, limit: usize) -> FlowResult<Self> {
        let log = storage
            .open_log(path)
            .map_err(|err| FlowError::storage("open log", path, err))?;
        Ok(Self::from_writer(log, echo, limit))
    }

    pub fn from_writer(log: Box<dyn Write + Send>, echo: bool, limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureInner {
                log,
                echo,
                limit,
                step: Vec::new(),
                step_truncated: 0,
                failed: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_stdout(&self, bytes: &[u8]) {
        self.lock().capture(Stream::Stdout, bytes);
    }

    pub fn write_stderr(&self, bytes: &[u8]) {
        self.lock().capture(Stream::Stderr, bytes);
    }

    /// Write one runner line (banner, marker, diagnostic) to log and console.
    ///
    /// Runner lines are not part of any step's captured output.
    pub fn line(&self, text: &str) {
        let mut inner = self.lock();
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        inner.append(&bytes);
        if inner.echo {
            echo(Stream::Stdout, &bytes);
        }
    }

    /// Reset the in-memory buffer for a new step.
    pub fn begin_step(&self) {
        let mut inner = self.lock();
        inner.step.clear();
        inner.step_truncated = 0;
    }

    /// Output of the current step and the number of bytes dropped past the limit.
    pub fn take_step(&self) -> (String, usize) {
        let mut inner = self.lock();
        let output = String::from_utf8_lossy(&inner.step).into_owned();
        let truncated = inner.step_truncated;
        inner.step.clear();
        inner.step_truncated = 0;
        (output, truncated)
    }

    /// Flush the log and report the first write failure, if any.
    pub fn finish(&self, path: &Path) -> FlowResult<()> {
        let mut inner = self.lock();
        if let Err(err) = inner.log.flush() {
            inner.failed.get_or_insert(err);
        }
        match inner.failed.take() {
            Some(err) => Err(FlowError::storage("append log", path, err)),
            None => Ok(()),
        }
    }
}

impl CaptureInner {
    fn capture(&mut self, stream: Stream, bytes: &[u8]) {
        self.append(bytes);
        if self.echo {
            echo(stream, bytes);
        }
        let remaining = self.limit.saturating_sub(self.step.len());
        let keep = bytes.len().min(remaining);
        self.step.extend_from_slice(&bytes[..keep]);
        self.step_truncated += bytes.len() - keep;
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.failed.is_some() {
            return;
        }
        let result = self.log.write_all(bytes).and_then(|()| self.log.flush());
        if let Err(err) = result {
            warn!(err = %err, "failed to append to log artifact");
            self.failed = Some(err);
        }
    }
}

fn echo(stream: Stream, bytes: &[u8]) {
    let result = match stream {
        Stream::Stdout => {
            let mut out = io::stdout().lock();
            out.write_all(bytes).and_then(|()| out.flush())
        }
        Stream::Stderr => {
            let mut err = io::stderr().lock();
            err.write_all(bytes).and_then(|()| err.flush())
        }
    };
    if let Err(err) = result {
        warn!(err = %err, "failed to echo unit output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::storage::MemoryStorage;

    #[test]
    fn interleaves_streams_and_runner_lines_in_order() {
        let storage = MemoryStorage::new();
        let path = Path::new("unit_execution_output.txt");
        let capture = CaptureLog::open(&storage, path, false, 1024).expect("open");
        capture.line("--- step 1/1: load ---");
        capture.write_stdout(b"rows: 3\n");
        capture.write_stderr(b"warning: slow disk\n");
        capture.finish(path).expect("finish");

        let log = storage.read_to_string(path).expect("read");
        assert_eq!(
            log,
            "--- step 1/1: load ---\nrows: 3\nwarning: slow disk\n"
        );
    }

    #[test]
    fn step_buffer_is_bounded_but_log_is_not() {
        let storage = MemoryStorage::new();
        let path = Path::new("unit_execution_output.txt");
        let capture = CaptureLog::open(&storage, path, false, 4).expect("open");
        capture.begin_step();
        capture.write_stdout(b"abcdef");
        capture.write_stdout(b"gh");
        let (output, truncated) = capture.take_step();
        assert_eq!(output, "abcd");
        assert_eq!(truncated, 4);
        assert_eq!(storage.read_to_string(path).expect("read"), "abcdefgh");
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_surfaces_as_storage_error() {
        let capture = CaptureLog::from_writer(Box::new(BrokenWriter), false, 16);
        capture.write_stdout(b"lost\n");
        let err = capture
            .finish(Path::new("unit_execution_output.txt"))
            .unwrap_err();
        assert_eq!(err.kind(), "StorageError");
        assert!(err.to_string().contains("disk full"));
    }
}
