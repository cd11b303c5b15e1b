//! Bounded stdout/stderr tailing for a running executor.
//!
//! Container output is fed into two [`Ring`] buffers. A background loop
//! flushes whatever accumulated as `EXECUTOR_STDOUT` / `EXECUTOR_STDERR`
//! events every `interval`, clearing the buffers so each event carries
//! only new bytes. The reducer appends those chunks and keeps the tail.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::ExecutorWriter;
use super::ring::Ring;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// One stream's unsent bytes.
struct Pending {
    ring: Ring,
    /// Start of a UTF-8 sequence whose remaining bytes have not arrived.
    partial: Vec<u8>,
}

impl Pending {
    fn new(size: usize) -> Self {
        Self {
            ring: Ring::new(size),
            partial: Vec::new(),
        }
    }

    /// Drain the ring as text. Unless `last`, an incomplete trailing
    /// character is held back for the next call.
    fn take(&mut self, last: bool) -> String {
        let dropped = self.ring.total_written() > self.ring.len() as u64;
        let fresh = self.ring.take();
        let mut bytes = if dropped {
            // The held prefix no longer lines up with what follows, and
            // the ring may have cut a character in half.
            self.partial.clear();
            let skip = fresh.iter().take(3).take_while(|b| is_continuation(**b)).count();
            fresh[skip..].to_vec()
        } else {
            let mut bytes = std::mem::take(&mut self.partial);
            bytes.extend(fresh);
            bytes
        };
        if !last {
            let keep = incomplete_suffix(&bytes);
            self.partial = bytes.split_off(bytes.len() - keep);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_suffix(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        if is_continuation(bytes[i]) {
            continue;
        }
        let need = match bytes[i] {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < need { have } else { 0 };
    }
    0
}

struct Buffers {
    stdout: Mutex<Pending>,
    stderr: Mutex<Pending>,
    /// Serializes flushes so chunks reach the writer in order.
    flush_lock: tokio::sync::Mutex<()>,
}

impl Buffers {
    fn pending(&self, stream: Stream) -> &Mutex<Pending> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    fn take(&self, stream: Stream, last: bool) -> String {
        match self.pending(stream).lock() {
            Ok(mut p) => p.take(last),
            Err(poisoned) => poisoned.into_inner().take(last),
        }
    }

    async fn flush(&self, out: &ExecutorWriter, last: bool) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let stdout = self.take(Stream::Stdout, last);
        if !stdout.is_empty() {
            out.stdout(stdout).await?;
        }
        let stderr = self.take(Stream::Stderr, last);
        if !stderr.is_empty() {
            out.stderr(stderr).await?;
        }
        Ok(())
    }
}

/// Tails one executor's output streams.
pub struct LogTailer {
    buffers: Arc<Buffers>,
    out: ExecutorWriter,
    stop: CancellationToken,
    flusher: Option<JoinHandle<()>>,
}

impl LogTailer {
    /// Start tailing. Each buffer holds at most `size` bytes and is flushed
    /// every `interval`.
    pub fn start(out: ExecutorWriter, size: usize, interval: Duration) -> Self {
        let buffers = Arc::new(Buffers {
            stdout: Mutex::new(Pending::new(size)),
            stderr: Mutex::new(Pending::new(size)),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        let stop = CancellationToken::new();

        let flusher = {
            let buffers = Arc::clone(&buffers);
            let out = out.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(e) = buffers.flush(&out, false).await {
                                warn!(task_id = out.id(), index = out.index(), "log flush failed: {e}");
                            }
                        }
                    }
                }
            })
        };

        Self {
            buffers,
            out,
            stop,
            flusher: Some(flusher),
        }
    }

    pub fn stdout(&self) -> TailWriter {
        TailWriter {
            buffers: Arc::clone(&self.buffers),
            stream: Stream::Stdout,
        }
    }

    pub fn stderr(&self) -> TailWriter {
        TailWriter {
            buffers: Arc::clone(&self.buffers),
            stream: Stream::Stderr,
        }
    }

    /// Emit buffered output now.
    pub async fn flush(&self) -> Result<()> {
        self.buffers.flush(&self.out, false).await
    }

    /// Stop the periodic flush and emit whatever remains.
    pub async fn close(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.await;
        }
        self.buffers.flush(&self.out, true).await
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// An [`AsyncWrite`] that appends into one of the tailer's buffers.
#[derive(Clone)]
pub struct TailWriter {
    buffers: Arc<Buffers>,
    stream: Stream,
}

impl TailWriter {
    fn append(&self, bytes: &[u8]) {
        match self.buffers.pending(self.stream).lock() {
            Ok(mut p) => p.ring.write(bytes),
            Err(poisoned) => poisoned.into_inner().ring.write(bytes),
        }
    }
}

impl AsyncWrite for TailWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Writes every chunk to two writers: a file on disk and a tailer.
pub struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Tee<A, B> {
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A, B> AsyncWrite for Tee<A, B>
where
    A: AsyncWrite + Unpin,
    B: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // The primary writer decides how much was consumed; the secondary
        // receives exactly that prefix.
        let n = match Pin::new(&mut self.a).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        let mut written = 0;
        while written < n {
            match Pin::new(&mut self.b).poll_write(cx, &buf[written..n]) {
                Poll::Ready(Ok(0)) => break,
                Poll::Ready(Ok(m)) => written += m,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.a).poll_flush(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.b).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.a).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.b).poll_shutdown(cx),
            other => other,
        }
    }
}
