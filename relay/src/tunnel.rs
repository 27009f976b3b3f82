//! Tunnel between one browser client and one guacd connection
//!
//! The guacd stream is split into halves, each behind its own lock. Access
//! goes through scoped guards: the reader guard is held by whichever task is
//! pumping guacd data toward the browser, the writer guard by whichever task
//! is forwarding one batch of browser data. Dropping a guard releases it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use guactunnel_shared::io::{GuacamoleReader, GuacamoleWriter};
use guactunnel_shared::protocol::Instruction;
use guactunnel_shared::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendHandle, BackendStream};

pub type BackendReader = GuacamoleReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type BackendWriter = GuacamoleWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Handle to an open tunnel. Clones share the same connection.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    uuid: Uuid,
    /// Connection ID assigned by guacd in its `ready` instruction
    connection_id: Option<String>,
    reader: Arc<Mutex<BackendReader>>,
    writer: Arc<Mutex<BackendWriter>>,
    backend: BackendHandle,
    open: AtomicBool,
    closed: watch::Sender<bool>,
    queued_readers: AtomicUsize,
}

impl Tunnel {
    pub fn new<S>(stream: S, connection_id: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (stream, backend) = BackendStream::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(
            GuacamoleReader::new(Box::new(read_half)),
            GuacamoleWriter::new(Box::new(write_half)),
            backend,
            connection_id,
        )
    }

    /// Build a tunnel around a reader that may already hold buffered data,
    /// as left behind by the guacd handshake. `backend` must sever the
    /// stream both halves were split from.
    pub fn from_parts(
        reader: BackendReader,
        writer: BackendWriter,
        backend: BackendHandle,
        connection_id: Option<String>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(TunnelInner {
                uuid: Uuid::new_v4(),
                connection_id,
                reader: Arc::new(Mutex::new(reader)),
                writer: Arc::new(Mutex::new(writer)),
                backend,
                open: AtomicBool::new(true),
                closed,
                queued_readers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.inner.connection_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Close the tunnel and drop the guacd connection, even while other
    /// handles or guards are alive. Blocked reads end immediately and
    /// blocked writes fail. Safe to call repeatedly.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            debug!("Closing tunnel {}", self.inner.uuid);
            self.inner.closed.send_replace(true);
            self.inner.backend.release();
        }
    }

    /// True if some other task is waiting to acquire the reader.
    pub fn has_queued_readers(&self) -> bool {
        self.inner.queued_readers.load(Ordering::Acquire) > 0
    }

    pub async fn acquire_reader(&self) -> ReaderGuard {
        let reader = {
            let _queued = QueuedReader::new(&self.inner.queued_readers);
            self.inner.reader.clone().lock_owned().await
        };
        ReaderGuard {
            reader,
            closed: self.inner.closed.subscribe(),
        }
    }

    /// Exclusive access to the guacd writer. Fails once the tunnel is closed.
    pub async fn acquire_writer(&self) -> Result<WriterGuard> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let writer = self.inner.writer.clone().lock_owned().await;
        if !self.is_open() {
            return Err(self.closed_error());
        }
        Ok(WriterGuard { writer })
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionClosed(format!("Tunnel {} is closed.", self.inner.uuid))
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("uuid", &self.inner.uuid)
            .field("connection_id", &self.inner.connection_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Counts a task waiting on the reader lock, including if the wait is
/// cancelled.
struct QueuedReader<'a>(&'a AtomicUsize);

impl<'a> QueuedReader<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for QueuedReader<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ReaderGuard {
    reader: OwnedMutexGuard<BackendReader>,
    closed: watch::Receiver<bool>,
}

impl ReaderGuard {
    pub fn available(&self) -> bool {
        self.reader.available()
    }

    /// Read the next instruction. `None` once guacd ends the stream or the
    /// tunnel is closed. Cancel safe.
    pub async fn read(&mut self) -> Result<Option<Instruction>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Ok(None),
            result = self.reader.read() => result,
        }
    }

    /// Like `read`, but returns the instruction exactly as guacd sent it.
    pub async fn read_raw(&mut self) -> Result<Option<String>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Ok(None),
            result = self.reader.read_raw() => result,
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

pub struct WriterGuard {
    writer: OwnedMutexGuard<BackendWriter>,
}

impl Deref for WriterGuard {
    type Target = BackendWriter;

    fn deref(&self) -> &BackendWriter {
        &self.writer
    }
}

impl DerefMut for WriterGuard {
    fn deref_mut(&mut self) -> &mut BackendWriter {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_writers_never_interleave() {
        const N: usize = 200;
        const M: usize = 150;

        let (client, guacd) = tokio::io::duplex(1024);
        let tunnel = Tunnel::new(client, None);

        let collector = tokio::spawn(async move {
            let mut reader = GuacamoleReader::new(guacd);
            let mut seen = Vec::new();
            while let Some(inst) = reader.read().await.unwrap() {
                seen.push(inst);
            }
            seen
        });

        let spawn_writer = |tag: &'static str, count: usize| {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                for i in 0..count {
                    let encoded = Instruction::new(tag, vec![i.to_string(), "x".repeat(40)]).encode();
                    let (head, tail) = encoded.split_at(encoded.len() / 2);
                    let mut writer = tunnel.acquire_writer().await.unwrap();
                    writer.write_raw(head).await.unwrap();
                    tokio::task::yield_now().await;
                    writer.write_raw(tail).await.unwrap();
                }
            })
        };

        let pump = spawn_writer("sync", N);
        let pinger = spawn_writer("", M);
        pump.await.unwrap();
        pinger.await.unwrap();

        tunnel.acquire_writer().await.unwrap().shutdown().await.unwrap();
        let seen = collector.await.unwrap();

        assert_eq!(seen.len(), N + M);
        let syncs: Vec<_> = seen.iter().filter(|i| i.opcode() == "sync").collect();
        assert_eq!(syncs.len(), N);
        for (i, inst) in syncs.iter().enumerate() {
            assert_eq!(inst.args()[0], i.to_string());
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, Some("$abc".into()));
        assert!(tunnel.is_open());
        assert_eq!(tunnel.connection_id(), Some("$abc"));

        drop(guacd);
        assert!(tunnel.acquire_reader().await.read().await.unwrap().is_none());

        tunnel.close();
        tunnel.close();
        assert!(!tunnel.is_open());
        assert!(matches!(
            tunnel.acquire_writer().await,
            Err(Error::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (client, _guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, None);

        let blocked = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.acquire_reader().await.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnel.close();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queued_readers() {
        let (client, mut guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, None);

        let first = tunnel.acquire_reader().await;
        assert!(!tunnel.has_queued_readers());

        let waiting = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let mut reader = tunnel.acquire_reader().await;
                reader.read().await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tunnel.has_queued_readers());

        drop(first);
        guacd.write_all(b"3.nop;").await.unwrap();
        let inst = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(inst.opcode(), "nop");
        assert!(!tunnel.has_queued_readers());
    }

    #[tokio::test]
    async fn test_uuid_is_stable_across_clones() {
        let (client, _guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, None);
        assert_eq!(tunnel.clone().uuid(), tunnel.uuid());
        assert_eq!(tunnel.uuid().to_string().len(), 36);
    }

    #[tokio::test]
    async fn test_close_releases_guacd_while_handles_alive() {
        let (client, mut guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, None);
        let held = tunnel.clone();
        let _writer = held.acquire_writer().await.unwrap();

        tunnel.close();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_millis(500), guacd.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(!held.is_open());
    }

    #[tokio::test]
    async fn test_close_fails_stalled_write() {
        let (client, _guacd) = tokio::io::duplex(16);
        let tunnel = Tunnel::new(client, None);

        let stalled = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let mut writer = tunnel.acquire_writer().await?;
                writer.write_raw(&"x".repeat(1024)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stalled.is_finished());

        tunnel.close();
        let result = tokio::time::timeout(Duration::from_millis(500), stalled)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[test]
    fn test_debug_shows_identity() {
        let (client, _guacd) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(client, Some("$abc".into()));
        let shown = format!("{:?}", tunnel);
        assert!(shown.contains(&tunnel.uuid().to_string()));
        assert!(shown.contains("$abc"));
    }
}
