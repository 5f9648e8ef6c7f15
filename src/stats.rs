//! Session diagnostics
//!
//! Counters shared by the pipeline threads. All counters are advisory
//! and use relaxed atomics; none of them participate in control flow.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Counters for one streaming session.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Bytes successfully written to the uplink.
    bytes_sent: AtomicU64,
    /// Datagrams successfully written to the uplink.
    datagrams_sent: AtomicU64,
    /// Datagram sends that failed (timeout or transport error).
    send_failures: AtomicU64,
    /// Send failures whose errno marked the socket as bad.
    fatal_socket_errors: AtomicU64,
    /// Sum of per-datagram send durations, for the average.
    send_duration_total_ms: AtomicU64,
    /// Worst per-datagram send duration seen so far.
    worst_send_duration_ms: AtomicU64,
    /// Sends that took longer than one block duration.
    sends_over_block_duration: AtomicU64,
    /// Capture overruns (XRUN) recovered via prepare.
    overruns: AtomicU64,
    /// Short reads from the capture device.
    underruns: AtomicU64,
    /// Other capture device errors.
    device_errors: AtomicU64,
    /// Audio blocks encoded into datagrams.
    blocks_encoded: AtomicU64,
    /// Ring overflows (datagrams dropped oldest-first).
    ring_overflows: AtomicU64,
    /// Sequence number of the most recently encoded datagram.
    last_sequence: AtomicU32,
    /// Most recent round-trip delay measured from a timing datagram.
    last_round_trip_us: AtomicI64,
    /// Scan windows that expired without a valid timing datagram.
    timing_timeouts: AtomicU64,
    /// Timing datagrams rejected as stale.
    stale_timings: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self, fatal: bool) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        if fatal {
            self.fatal_socket_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one datagram's send duration. Returns the previous worst
    /// if this is a new peak.
    pub fn record_send_duration(&self, duration_ms: u64, block_duration_ms: u64) -> Option<u64> {
        self.send_duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if duration_ms > block_duration_ms {
            self.sends_over_block_duration
                .fetch_add(1, Ordering::Relaxed);
        }
        let worst = self.worst_send_duration_ms.load(Ordering::Relaxed);
        if duration_ms > worst {
            self.worst_send_duration_ms
                .store(duration_ms, Ordering::Relaxed);
            Some(worst)
        } else {
            None
        }
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_encoded(&self, sequence: u16) {
        self.blocks_encoded.fetch_add(1, Ordering::Relaxed);
        self.last_sequence.store(sequence as u32, Ordering::Relaxed);
    }

    pub fn record_ring_overflows(&self, count: u64) {
        self.ring_overflows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_round_trip(&self, delay_us: i64) {
        self.last_round_trip_us.store(delay_us, Ordering::Relaxed);
    }

    pub fn record_timing_timeout(&self) {
        self.timing_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_timing(&self) {
        self.stale_timings.fetch_add(1, Ordering::Relaxed);
    }

    /// Sequence number of the most recently encoded datagram.
    pub fn last_sequence(&self) -> u16 {
        self.last_sequence.load(Ordering::Relaxed) as u16
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let datagrams = self.datagrams_sent.load(Ordering::Relaxed);
        let total_ms = self.send_duration_total_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_sent: datagrams,
            send_failures: self.send_failures.load(Ordering::Relaxed),
            fatal_socket_errors: self.fatal_socket_errors.load(Ordering::Relaxed),
            average_send_duration_ms: if datagrams > 0 {
                total_ms as f64 / datagrams as f64
            } else {
                0.0
            },
            worst_send_duration_ms: self.worst_send_duration_ms.load(Ordering::Relaxed),
            sends_over_block_duration: self.sends_over_block_duration.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            blocks_encoded: self.blocks_encoded.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
            last_sequence: self.last_sequence(),
            last_round_trip_us: self.last_round_trip_us.load(Ordering::Relaxed),
            timing_timeouts: self.timing_timeouts.load(Ordering::Relaxed),
            stale_timings: self.stale_timings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub datagrams_sent: u64,
    pub send_failures: u64,
    pub fatal_socket_errors: u64,
    pub average_send_duration_ms: f64,
    pub worst_send_duration_ms: u64,
    pub sends_over_block_duration: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub device_errors: u64,
    pub blocks_encoded: u64,
    pub ring_overflows: u64,
    pub last_sequence: u16,
    pub last_round_trip_us: i64,
    pub timing_timeouts: u64,
    pub stale_timings: u64,
}
