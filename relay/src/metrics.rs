//! Metrics Collection for GuacTunnel Relay
//!
//! Atomic counters exported in Prometheus text format on /metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use guactunnel_shared::Status;

/// Relay-wide metrics
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    /// Tunnels currently open
    active_tunnels: AtomicU64,
    tunnels_opened: AtomicU64,
    /// Closures by status class
    closed_normal: AtomicU64,
    closed_client_error: AtomicU64,
    closed_error: AtomicU64,
    /// guacd -> browser
    instructions_out: AtomicU64,
    bytes_out: AtomicU64,
    /// browser -> guacd
    instructions_in: AtomicU64,
    bytes_in: AtomicU64,
    pings_answered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tunnel_opened(&self) {
        self.inner.tunnels_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a tunnel with the status it ended with.
    pub fn tunnel_closed(&self, status: Status) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
        let counter = match status {
            Status::Success | Status::ResourceClosed => &self.inner.closed_normal,
            s if s.is_client_error() => &self.inner.closed_client_error,
            _ => &self.inner.closed_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Data sent toward the browser
    pub fn record_to_client(&self, instructions: u64, bytes: u64) {
        self.inner.instructions_out.fetch_add(instructions, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Data forwarded to guacd
    pub fn record_to_server(&self, instructions: u64, bytes: u64) {
        self.inner.instructions_in.fetch_add(instructions, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn pings_answered(&self, count: u64) {
        self.inner.pings_answered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn active_tunnels(&self) -> u64 {
        self.inner.active_tunnels.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub fn to_prometheus(&self) -> String {
        let m = &self.inner;
        format!(
r#"# HELP guactunnel_active_tunnels Number of open tunnels
# TYPE guactunnel_active_tunnels gauge
guactunnel_active_tunnels {}

# HELP guactunnel_tunnels_opened_total Tunnels opened since start
# TYPE guactunnel_tunnels_opened_total counter
guactunnel_tunnels_opened_total {}

# HELP guactunnel_tunnels_closed_total Tunnels closed, by status class
# TYPE guactunnel_tunnels_closed_total counter
guactunnel_tunnels_closed_total{{status="normal"}} {}
guactunnel_tunnels_closed_total{{status="client_error"}} {}
guactunnel_tunnels_closed_total{{status="error"}} {}

# HELP guactunnel_instructions_total Instructions relayed
# TYPE guactunnel_instructions_total counter
guactunnel_instructions_total{{direction="in"}} {}
guactunnel_instructions_total{{direction="out"}} {}

# HELP guactunnel_bytes_total Instruction bytes relayed
# TYPE guactunnel_bytes_total counter
guactunnel_bytes_total{{direction="in"}} {}
guactunnel_bytes_total{{direction="out"}} {}

# HELP guactunnel_pings_total Tunnel pings answered
# TYPE guactunnel_pings_total counter
guactunnel_pings_total {}
"#,
            self.active_tunnels(),
            m.tunnels_opened.load(Ordering::Relaxed),
            m.closed_normal.load(Ordering::Relaxed),
            m.closed_client_error.load(Ordering::Relaxed),
            m.closed_error.load(Ordering::Relaxed),
            m.instructions_in.load(Ordering::Relaxed),
            m.instructions_out.load(Ordering::Relaxed),
            m.bytes_in.load(Ordering::Relaxed),
            m.bytes_out.load(Ordering::Relaxed),
            m.pings_answered.load(Ordering::Relaxed),
        )
    }
}
