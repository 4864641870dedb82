//! Monitoring collaborator.
//!
//! The session layer reports heartbeat latency and the active session count
//! through [`MetricsSink`]. Calls are fire-and-forget: implementations must not
//! block, and failures inside them never affect a session.

use tracing::{debug, info};

/// Receives protocol measurements.
pub trait MetricsSink: Send + Sync {
    /// Round-trip time of one heartbeat, in milliseconds.
    fn record_latency_sample(&self, rtt_ms: f64);

    /// Number of established sessions after a change.
    fn record_active_sessions(&self, count: u32);
}

/// Default sink: writes measurements to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_latency_sample(&self, rtt_ms: f64) {
        debug!(target: "kvm::metrics", rtt_ms, "heartbeat latency");
    }

    fn record_active_sessions(&self, count: u32) {
        info!(target: "kvm::metrics", count, "active sessions");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_latency_sample(&self, _rtt_ms: f64) {}

    fn record_active_sessions(&self, _count: u32) {}
}
