//! Shared output capture with a combined byte cap and an idle-activity clock.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

/// Which stream a chunk of output belongs to. PTY spawns deliver a single
/// merged stream, reported as stdout.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

struct SinkState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    total: u64,
    overflowed: bool,
}

/// Collects child output from concurrent readers.
///
/// All bytes read count toward the combined cap; buffered bytes are
/// truncated at the cap so a faulting child cannot balloon memory. Output
/// exactly at the cap is fine; one byte more trips the overflow signal.
pub(crate) struct OutputSink {
    limit: u64,
    state: Mutex<SinkState>,
    activity: Mutex<Instant>,
    overflow: Notify,
}

impl OutputSink {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(SinkState {
                stdout: Vec::new(),
                stderr: Vec::new(),
                total: 0,
                overflowed: false,
            }),
            activity: Mutex::new(Instant::now()),
            overflow: Notify::new(),
        }
    }

    fn append(&self, stream: StreamKind, data: &[u8]) {
        let mut state = self.state.lock();
        let remaining = self.limit.saturating_sub(state.total) as usize;
        let keep = data.len().min(remaining);
        match stream {
            StreamKind::Stdout => state.stdout.extend_from_slice(&data[..keep]),
            StreamKind::Stderr => state.stderr.extend_from_slice(&data[..keep]),
        }
        state.total += data.len() as u64;
        if state.total > self.limit && !state.overflowed {
            state.overflowed = true;
            self.overflow.notify_one();
        }
    }

    fn touch(&self) {
        *self.activity.lock() = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.activity.lock()
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Resolves once the combined cap has been crossed. A stored permit
    /// makes this reliable even if the crossing happened before the
    /// supervisor started waiting.
    pub(crate) async fn wait_overflow(&self) {
        if self.overflowed() {
            return;
        }
        self.overflow.notified().await;
    }

    /// Lossy-decoded snapshot of both buffers.
    pub(crate) fn snapshot(&self) -> (String, String) {
        let state = self.state.lock();
        (
            String::from_utf8_lossy(&state.stdout).into_owned(),
            String::from_utf8_lossy(&state.stderr).into_owned(),
        )
    }
}

/// Drain one child stream into the sink until EOF or read error.
///
/// Every successful read refreshes the idle clock before the bytes are
/// accounted, so the idle timer measures silence, not buffer pressure.
pub(crate) async fn pump<R>(mut reader: R, sink: Arc<OutputSink>, stream: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink.touch();
                sink.append(stream, &buf[..n]);
            },
        }
    }
}
