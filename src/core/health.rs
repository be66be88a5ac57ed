use hdrhistogram::Histogram;
use std::time::{Duration, Instant};

use super::circular_buffer::CircularBuffer;
use super::types::{ConnectionStats, DisconnectCause};

const MAX_RECENT_DISCONNECTS: usize = 32;
const MAX_CAUSE_TEXT_BYTES: usize = 512;

#[derive(Debug, Clone)]
struct DisconnectRec {
    at: Instant,
    cause: String,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_CAUSE_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_CAUSE_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Per-client connection counters and keepalive round-trip histogram.
#[derive(Debug)]
pub struct HealthMonitor {
    connection_started: Instant,
    last_message_received: Instant,
    received_count: u64,
    sent_count: u64,
    reconnect_count: u64,
    disconnect_count: u64,
    recent_disconnects: CircularBuffer<DisconnectRec>,
    // None only if hdrhistogram rejects the bounds, which it does not for these constants.
    rtt_histogram: Option<Histogram<u64>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connection_started: now,
            last_message_received: now,
            received_count: 0,
            sent_count: 0,
            reconnect_count: 0,
            disconnect_count: 0,
            recent_disconnects: CircularBuffer::new(MAX_RECENT_DISCONNECTS),
            rtt_histogram: Histogram::new_with_bounds(1, 60_000_000, 3).ok(),
        }
    }

    /// Called on every successful connect.
    pub fn on_connected(&mut self) {
        let now = Instant::now();
        self.connection_started = now;
        self.last_message_received = now;
    }

    pub fn record_received(&mut self) {
        self.last_message_received = Instant::now();
        self.received_count = self.received_count.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.sent_count = self.sent_count.saturating_add(1);
    }

    pub fn record_disconnect(&mut self, cause: &DisconnectCause) {
        self.disconnect_count = self.disconnect_count.saturating_add(1);
        self.recent_disconnects.push(DisconnectRec {
            at: Instant::now(),
            cause: truncate_string(&cause.to_string()),
        });
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
        if let Some(histogram) = self.rtt_histogram.as_mut() {
            histogram.saturating_record(micros.max(1));
        }
    }

    pub fn get_stats(&self) -> ConnectionStats {
        let (samples, p50, p99) = match &self.rtt_histogram {
            Some(histogram) if histogram.len() > 0 => (
                histogram.len(),
                histogram.value_at_percentile(50.0),
                histogram.value_at_percentile(99.0),
            ),
            _ => (0, 0, 0),
        };

        ConnectionStats {
            uptime: self.connection_started.elapsed(),
            messages_received: self.received_count,
            messages_sent: self.sent_count,
            reconnects: self.reconnect_count,
            unexpected_disconnects: self.disconnect_count,
            last_message_age: self.last_message_received.elapsed(),
            recent_disconnects: self
                .recent_disconnects
                .iter()
                .map(|rec| format!("{:?} ago: {}", rec.at.elapsed(), rec.cause))
                .collect(),
            p50_rtt_us: p50,
            p99_rtt_us: p99,
            rtt_samples: samples,
        }
    }
}
