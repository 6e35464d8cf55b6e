//! Bounded, cancellable byte pipe between a background producer and a reader.
//!
//! ```text
//!   producer task ──AsyncWrite──► PipeWriter ──[Data(seg) | End | Failed]──► PipeReader ──AsyncRead──► consumer
//!                                          bounded mpsc of pooled segments
//! ```
//!
//! The writer backpressures once `capacity` segments are queued. The stream
//! only ends cleanly on an explicit `End` frame: a producer that vanishes
//! without completing surfaces as `UnexpectedEof` on the reader, never as a
//! silently short stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};

use crate::error::CipherError;
use crate::pool::{BufferPool, PooledBuffer};

/// Largest segment a single `poll_write` will enqueue
pub const MAX_SEGMENT_LEN: usize = 256 * 1024;

enum Frame {
    Data(PooledBuffer),
    End,
    Failed(io::Error),
}

/// Create a connected writer/reader pair.
pub fn bounded_pipe(
    capacity: usize,
    pool: BufferPool,
    cancel: CancellationToken,
) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = PipeWriter {
        tx: PollSender::new(tx),
        pool,
        cancelled: Box::pin(cancel.clone().cancelled_owned()),
        cancel: cancel.clone(),
    };
    let reader = PipeReader {
        rx,
        current: None,
        done: false,
        cancel,
        task: None,
    };
    (writer, reader)
}

/// Run `producer` on a background task feeding the returned reader.
///
/// The producer's result becomes the end of the stream: `Ok` ends it
/// cleanly, `Err` is handed to the reader. Dropping the reader cancels the
/// pipe's token; the producer sees that through [`PipeWriter::cancellation`]
/// and through failing writes, and is always run to completion so whatever
/// it holds is released before [`PipeReader::close`] returns.
pub fn spawn_pipe<F, Fut>(
    capacity: usize,
    pool: BufferPool,
    cancel: &CancellationToken,
    producer: F,
) -> PipeReader
where
    F: FnOnce(PipeWriter) -> Fut,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    let token = cancel.child_token();
    let (writer, mut reader) = bounded_pipe(capacity, pool, token.clone());
    let completion = writer.tx.get_ref().cloned();
    let work = producer(writer);

    let task = tokio::spawn(async move {
        let result = match work.await {
            Ok(()) if token.is_cancelled() => Err(CipherError::Cancelled.into()),
            result => result,
        };
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "pipe producer failed");
        }
        if let Some(tx) = completion {
            let frame = match result {
                Ok(()) => Frame::End,
                Err(e) => Frame::Failed(e),
            };
            // the reader may already be gone
            let _ = tx.send(frame).await;
        }
    });
    reader.task = Some(task);
    reader
}

/// Write end of a pipe. Each write is copied into a pooled segment.
pub struct PipeWriter {
    tx: PollSender<Frame>,
    pool: BufferPool,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl PipeWriter {
    /// Token cancelled when the reader goes away or the parent is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// End the stream, either cleanly or with an error for the reader.
    pub async fn complete(mut self, result: io::Result<()>) {
        let frame = match result {
            Ok(()) => Frame::End,
            Err(e) => Frame::Failed(e),
        };
        if let Some(tx) = self.tx.get_ref().cloned() {
            self.tx.close();
            let _ = tx.send(frame).await;
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // also wakes a writer parked on a full queue
        if this.cancel.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(CipherError::Cancelled.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        let n = buf.len().min(MAX_SEGMENT_LEN);
        let mut segment = this.pool.lease(n);
        segment.set_sensitive();
        segment.copy_from_slice(&buf[..n]);
        if this.tx.send_item(Frame::Data(segment)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped")
}

/// Read end of a pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<Frame>,
    current: Option<(PooledBuffer, usize)>,
    done: bool,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PipeReader {
    /// Cancel the producer and wait for it to release its resources.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        self.current = None;
        while self.rx.recv().await.is_some() {}
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pipe producer panicked");
            }
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some((segment, pos)) = this.current.as_mut() {
                let n = (segment.len() - *pos).min(buf.remaining());
                buf.put_slice(&segment[*pos..*pos + n]);
                *pos += n;
                if *pos == segment.len() {
                    this.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Frame::Data(segment)) => {
                    if !segment.is_empty() {
                        this.current = Some((segment, 0));
                    }
                }
                Some(Frame::End) => {
                    this.done = true;
                    return Poll::Ready(Ok(()));
                }
                Some(Frame::Failed(e)) => {
                    this.done = true;
                    return Poll::Ready(Err(e));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe closed before end of stream",
                    )));
                }
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
