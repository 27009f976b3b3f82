//! Registry of tunnels opened through the HTTP transport
//!
//! Long-poll requests address their tunnel by UUID. Tunnels nobody has
//! touched for the idle timeout are closed by a background task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use dashmap::DashMap;
use guactunnel_shared::protocol::Instruction;
use guactunnel_shared::Status;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::tunnel::Tunnel;

/// Random bytes behind each session token
const TOKEN_LENGTH: usize = 33;

/// A tunnel plus the bookkeeping the HTTP transport needs for it.
pub struct RegisteredTunnel {
    tunnel: Tunnel,
    /// Secret the browser must present with every read and write
    token: String,
    registered_at: Instant,
    /// Milliseconds since `registered_at`
    last_access: AtomicU64,
    /// Instructions generated by the relay itself, sent ahead of guacd data
    outbound: Mutex<VecDeque<Instruction>>,
    outbound_ready: Notify,
}

impl RegisteredTunnel {
    fn new(tunnel: Tunnel) -> Self {
        let mut bytes = [0u8; TOKEN_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self {
            tunnel,
            token: BASE64_STANDARD.encode(bytes),
            registered_at: Instant::now(),
            last_access: AtomicU64::new(0),
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
        }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Compare a presented token without short-circuiting on the first
    /// mismatched byte.
    pub fn token_matches(&self, presented: &str) -> bool {
        let (expected, presented) = (self.token.as_bytes(), presented.as_bytes());
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }

    fn touch(&self) {
        let elapsed = self.registered_at.elapsed().as_millis() as u64;
        self.last_access.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access.load(Ordering::Relaxed));
        self.registered_at.elapsed().saturating_sub(last)
    }

    /// Queue instructions for the current or next read request.
    pub async fn push_outbound(&self, instructions: Vec<Instruction>) {
        if instructions.is_empty() {
            return;
        }
        self.outbound.lock().await.extend(instructions);
        self.outbound_ready.notify_one();
    }

    pub async fn take_outbound(&self) -> Vec<Instruction> {
        self.outbound.lock().await.drain(..).collect()
    }

    /// Resolves once something has been queued since the last take.
    pub async fn outbound_ready(&self) {
        self.outbound_ready.notified().await
    }
}

#[derive(Clone)]
pub struct TunnelMap {
    tunnels: Arc<DashMap<Uuid, Arc<RegisteredTunnel>>>,
    idle_timeout: Duration,
    metrics: Metrics,
}

impl TunnelMap {
    pub fn new(idle_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
            idle_timeout,
            metrics,
        }
    }

    pub fn put(&self, tunnel: Tunnel) -> Arc<RegisteredTunnel> {
        let registered = Arc::new(RegisteredTunnel::new(tunnel));
        self.tunnels
            .insert(registered.tunnel.uuid(), registered.clone());
        registered
    }

    /// Look up a tunnel, refreshing its last access time.
    pub fn get(&self, uuid: &Uuid) -> Option<Arc<RegisteredTunnel>> {
        let registered = self.tunnels.get(uuid)?.clone();
        registered.touch();
        Some(registered)
    }

    /// Remove and close a tunnel. Only the first call for a given tunnel
    /// returns true.
    pub fn close(&self, uuid: &Uuid, status: Status) -> bool {
        match self.tunnels.remove(uuid) {
            Some((_, registered)) => {
                registered.tunnel.close();
                self.metrics.tunnel_closed(status);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Close every tunnel idle for at least the idle timeout.
    pub fn close_idle(&self) -> usize {
        let idle: Vec<Uuid> = self
            .tunnels
            .iter()
            .filter(|entry| entry.idle_for() >= self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0;
        for uuid in idle {
            if self.close(&uuid, Status::SessionTimeout) {
                info!("HTTP tunnel {} expired", uuid);
                closed += 1;
            }
        }
        closed
    }

    /// Periodically expire idle tunnels. Runs forever.
    pub async fn run_reaper(self) {
        let mut interval = tokio::time::interval(self.idle_timeout);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let closed = self.close_idle();
            if closed > 0 {
                debug!("Expired {} idle HTTP tunnels, {} remain", closed, self.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> (Tunnel, tokio::io::DuplexStream) {
        let (client, guacd) = tokio::io::duplex(64);
        (Tunnel::new(client, None), guacd)
    }

    #[tokio::test]
    async fn test_put_get_close() {
        let metrics = Metrics::new();
        let map = TunnelMap::new(Duration::from_secs(15), metrics.clone());
        let (t, _guacd) = tunnel();
        metrics.tunnel_opened();
        let uuid = map.put(t.clone()).tunnel().uuid();

        assert!(map.get(&uuid).is_some());
        assert!(map.get(&Uuid::new_v4()).is_none());

        assert!(map.close(&uuid, Status::Success));
        assert!(!map.close(&uuid, Status::Success));
        assert!(map.get(&uuid).is_none());
        assert!(!t.is_open());
        assert_eq!(metrics.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_checked() {
        let map = TunnelMap::new(Duration::from_secs(15), Metrics::new());
        let (a, _g1) = tunnel();
        let (b, _g2) = tunnel();
        let (a, b) = (map.put(a), map.put(b));

        assert_eq!(a.token().len(), 44);
        assert_ne!(a.token(), b.token());
        assert!(a.token_matches(a.token()));
        assert!(!a.token_matches(b.token()));
        assert!(!a.token_matches(""));
        assert!(!a.token_matches(&a.token()[1..]));
    }

    #[tokio::test]
    async fn test_idle_tunnels_expire() {
        let metrics = Metrics::new();
        let map = TunnelMap::new(Duration::from_millis(200), metrics.clone());
        let (stale, _g1) = tunnel();
        let (fresh, _g2) = tunnel();
        metrics.tunnel_opened();
        metrics.tunnel_opened();
        map.put(stale.clone());
        map.put(fresh.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        map.get(&fresh.uuid());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(map.close_idle(), 1);
        assert!(!stale.is_open());
        assert!(fresh.is_open());
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_queue_keeps_order() {
        let map = TunnelMap::new(Duration::from_secs(15), Metrics::new());
        let (t, _guacd) = tunnel();
        let registered = map.put(t);

        let first = Instruction::internal(vec!["ping".into(), "1".into()]);
        let second = Instruction::internal(vec!["ping".into(), "2".into()]);
        registered.push_outbound(vec![first.clone()]).await;
        registered.push_outbound(vec![second.clone()]).await;

        // A permit is stored even if nobody was waiting
        registered.outbound_ready().await;
        assert_eq!(registered.take_outbound().await, vec![first, second]);
        assert!(registered.take_outbound().await.is_empty());
    }
}
