//! guacd connection that a tunnel can sever at any time
//!
//! The stream is shared by the reader and writer halves and by the tunnel
//! itself. Releasing it drops the socket at once, even while another task
//! is parked in a read or write; that task is woken and sees end-of-stream
//! or a broken pipe.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

struct Slot<S> {
    stream: Option<S>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

fn lock<S>(slot: &Mutex<Slot<S>>) -> MutexGuard<'_, Slot<S>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait Release: Send + Sync {
    fn release(&self);
}

impl<S: Send> Release for Mutex<Slot<S>> {
    fn release(&self) {
        let (stream, wakers) = {
            let mut slot = lock(self);
            (
                slot.stream.take(),
                [slot.read_waker.take(), slot.write_waker.take()],
            )
        };
        drop(stream);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

/// Backend stream wrapper. I/O after release reads as EOF and fails writes
/// with `BrokenPipe`.
pub struct BackendStream<S> {
    slot: Arc<Mutex<Slot<S>>>,
}

/// Severs the stream it was created with. Clones share the stream.
#[derive(Clone)]
pub struct BackendHandle {
    slot: Arc<dyn Release>,
}

impl BackendHandle {
    /// Drop the underlying connection. Safe to call repeatedly.
    pub fn release(&self) {
        self.slot.release();
    }
}

impl<S> BackendStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> (Self, BackendHandle) {
        let slot = Arc::new(Mutex::new(Slot {
            stream: Some(stream),
            read_waker: None,
            write_waker: None,
        }));
        let handle = BackendHandle { slot: slot.clone() };
        (Self { slot }, handle)
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "guacd connection released")
}

impl<S: AsyncRead + Unpin> AsyncRead for BackendStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut slot = lock(&self.slot);
        let Some(stream) = slot.stream.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let poll = Pin::new(stream).poll_read(cx, buf);
        if poll.is_pending() {
            slot.read_waker = Some(cx.waker().clone());
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BackendStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut slot = lock(&self.slot);
        let Some(stream) = slot.stream.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        let poll = Pin::new(stream).poll_write(cx, buf);
        if poll.is_pending() {
            slot.write_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = lock(&self.slot);
        let Some(stream) = slot.stream.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        let poll = Pin::new(stream).poll_flush(cx);
        if poll.is_pending() {
            slot.write_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = lock(&self.slot);
        match slot.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_release_closes_peer() {
        let (relay, mut guacd) = tokio::io::duplex(64);
        let (mut stream, handle) = BackendStream::new(relay);
        stream.write_all(b"4.sync,1.0;").await.unwrap();

        handle.release();
        handle.release();

        let mut received = String::new();
        tokio::time::timeout(Duration::from_millis(500), guacd.read_to_string(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "4.sync,1.0;");

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        let err = stream.write_all(b"3.nop;").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_release_wakes_parked_writer() {
        let (relay, _guacd) = tokio::io::duplex(16);
        let (mut stream, handle) = BackendStream::new(relay);

        // Nobody reads the other end, so this parks once the pipe is full
        let writer = tokio::spawn(async move { stream.write_all(&[b'x'; 1024]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        handle.release();
        let result = tokio::time::timeout(Duration::from_millis(500), writer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
