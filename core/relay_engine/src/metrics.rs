//! Lightweight Prometheus-compatible metrics for the relay.
//!
//! Every destination owns one [`StreamStats`] made of atomic counters, so the
//! forwarding path updates them without locks. [`render`] turns a set of
//! them into Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Per-destination transfer statistics.
pub struct StreamStats {
    /// Stable destination name (`ntrip_server`, `socket_server`, ...)
    name: &'static str,
    /// Bytes written towards the destination (counter)
    pub bytes_sent: AtomicU64,
    /// Bytes received from the destination (counter)
    pub bytes_received: AtomicU64,
    /// Successful connections (counter)
    pub connections_total: AtomicU64,
    /// Unix time of the last successful connect, 0 = never (gauge)
    pub last_connect_unix: AtomicU64,
    /// Unix time of the last disconnect, 0 = never (gauge)
    pub last_disconnect_unix: AtomicU64,
    /// Currently connected peers/sessions (gauge)
    pub connected: AtomicU64,
    /// Creation time (for uptime calculation)
    pub start_time: Instant,
}

impl StreamStats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            last_connect_unix: AtomicU64::new(0),
            last_disconnect_unix: AtomicU64::new(0),
            connected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Record a successful connect
    pub fn record_connect(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connected.fetch_add(1, Ordering::Relaxed);
        self.last_connect_unix.store(unix_now(), Ordering::Relaxed);
    }

    /// Record a disconnect; never drives the connected gauge below zero
    pub fn record_disconnect(&self) {
        let _ = self
            .connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.last_disconnect_unix.store(unix_now(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            name: self.name,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            last_connect_unix: self.last_connect_unix.load(Ordering::Relaxed),
            last_disconnect_unix: self.last_disconnect_unix.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of a [`StreamStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub name: &'static str,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections_total: u64,
    pub last_connect_unix: u64,
    pub last_disconnect_unix: u64,
    pub connected: u64,
    pub uptime_secs: u64,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render stats in Prometheus text exposition format.
pub fn render(stats: &[&StreamStats]) -> String {
    let snapshots: Vec<StatsSnapshot> = stats.iter().map(|s| s.snapshot()).collect();
    let mut out = String::new();

    let families: [(&str, &str, &str, fn(&StatsSnapshot) -> u64); 6] = [
        ("ntrip_relay_bytes_sent_total", "Total bytes sent to the destination", "counter", |s| s.bytes_sent),
        ("ntrip_relay_bytes_received_total", "Total bytes received from the destination", "counter", |s| s.bytes_received),
        ("ntrip_relay_connections_total", "Total successful connections", "counter", |s| s.connections_total),
        ("ntrip_relay_connected", "Currently connected sessions or peers", "gauge", |s| s.connected),
        ("ntrip_relay_last_connect_timestamp_seconds", "Unix time of the last connect", "gauge", |s| s.last_connect_unix),
        ("ntrip_relay_last_disconnect_timestamp_seconds", "Unix time of the last disconnect", "gauge", |s| s.last_disconnect_unix),
    ];

    for (metric, help, kind, value) in families.iter() {
        out.push_str(&format!("# HELP {} {}\n", metric, help));
        out.push_str(&format!("# TYPE {} {}\n", metric, kind));
        for snap in &snapshots {
            out.push_str(&format!("{}{{destination=\"{}\"}} {}\n", metric, snap.name, value(snap)));
        }
    }

    let uptime = snapshots.iter().map(|s| s.uptime_secs).max().unwrap_or(0);
    out.push_str(
        "# HELP ntrip_relay_uptime_seconds Relay uptime in seconds\n\
         # TYPE ntrip_relay_uptime_seconds gauge\n",
    );
    out.push_str(&format!("ntrip_relay_uptime_seconds {}\n", uptime));
    out
}
