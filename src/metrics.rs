#![forbid(unsafe_code)]

// Gateway metrics: atomic counters and a latency histogram, rendered as Prometheus text

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Bucket upper bounds: microseconds for storage, seconds for the `le` label
const BUCKETS: [(u64, &str); 9] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Values owned by other components, sampled at scrape time
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveGauges {
    pub rooms: usize,
    pub transports: usize,
    pub producers: usize,
    pub worker_restarts: u64,
    pub engine_running: bool,
}

/// Gateway-wide metrics. Clones share the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rate_limited_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    transports_created_total: AtomicU64,
    producers_created_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.inner.rate_limited_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn add_leaves(&self, n: u64) {
        self.inner.leaves_total.fetch_add(n, Relaxed);
    }

    pub fn inc_transports_created(&self) {
        self.inner.transports_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.inner.errors_total.load(Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    /// Counts the connection as active until the guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self, live: LiveGauges) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        let counters = [
            ("sfu_gateway_connections_total", "Total WebSocket connections", &i.connections_total),
            ("sfu_gateway_messages_received_total", "Total messages received from clients", &i.messages_received_total),
            ("sfu_gateway_messages_sent_total", "Total messages sent to clients", &i.messages_sent_total),
            ("sfu_gateway_errors_total", "Total error responses", &i.errors_total),
            ("sfu_gateway_rate_limited_total", "Messages dropped by the rate limiter", &i.rate_limited_total),
            ("sfu_gateway_joins_total", "Total room joins", &i.joins_total),
            ("sfu_gateway_leaves_total", "Total room leaves", &i.leaves_total),
            ("sfu_gateway_transports_created_total", "Total transports created", &i.transports_created_total),
            ("sfu_gateway_producers_created_total", "Total producers created", &i.producers_created_total),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, "counter", name, help, value.load(Relaxed));
        }
        render_metric(&mut out, "counter", "sfu_gateway_worker_restarts_total", "Media worker restarts after a crash", live.worker_restarts);

        render_metric(&mut out, "gauge", "sfu_gateway_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_metric(&mut out, "gauge", "sfu_gateway_rooms_active", "Rooms with at least one member", live.rooms as u64);
        render_metric(&mut out, "gauge", "sfu_gateway_transports_active", "Registered WebRTC transports", live.transports as u64);
        render_metric(&mut out, "gauge", "sfu_gateway_producers_active", "Registered producers", live.producers as u64);
        render_metric(&mut out, "gauge", "sfu_gateway_engine_up", "1 while the media worker is running", u64::from(live.engine_running));

        i.message_handling.render(
            "sfu_gateway_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, including on panic
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
