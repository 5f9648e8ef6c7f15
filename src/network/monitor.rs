//! Liveness monitor
//!
//! The server echoes one timing datagram per second carrying the
//! sequence number and timestamp of an uplink datagram it received.
//! The monitor resyncs on the sync byte, checks the echo against the
//! recently emitted sequence numbers and flips the application-level
//! link flag accordingly. A fresh echo also yields the round-trip
//! delay. The monitor never touches the socket beyond reading; teardown
//! belongs to the supervisor.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::events::StreamHooks;
use crate::protocol::{unix_micros, TimingDatagram, SYNC_BYTE, TIMING_DATAGRAM_SIZE};
use crate::session::LinkFlags;
use crate::stats::SessionStats;

/// Pause between read attempts within one scan.
const READ_POLL: Duration = Duration::from_millis(100);

/// Cumulative wait budget for one scan.
const SCAN_BUDGET: Duration = Duration::from_secs(1);

pub(crate) struct LivenessMonitor {
    pub stream: TcpStream,
    pub running: Arc<AtomicBool>,
    pub flags: Arc<LinkFlags>,
    pub hooks: Arc<StreamHooks>,
    pub stats: Arc<SessionStats>,
    /// Echoes older than this many datagrams are stale.
    pub age_window: u16,
    /// Scans without a valid echo before the link counts as lost.
    pub wait_scans: u32,
}

impl LivenessMonitor {
    pub(crate) fn run(mut self) {
        if let Err(e) = self.stream.set_read_timeout(Some(READ_POLL)) {
            warn!(error = %e, "cannot set read timeout; monitor exiting");
            return;
        }

        let mut no_valid = 0u32;
        while self.running.load(Ordering::Relaxed) {
            match self.scan() {
                Some(timing) => self.handle_timing(timing, &mut no_valid),
                None => {
                    no_valid += 1;
                    if no_valid > self.wait_scans {
                        self.stats.record_timing_timeout();
                        if self.flags.audio_comms_connected() {
                            warn!("no timing datagrams; audio link lost");
                        }
                        self.flags.set_audio(false);
                        no_valid = 0;
                    }
                }
            }
        }
    }

    /// One scan: find the sync byte, then collect the rest of the frame,
    /// all within the scan budget.
    fn scan(&mut self) -> Option<TimingDatagram> {
        let deadline = Instant::now() + SCAN_BUDGET;

        let mut byte = [0u8; 1];
        loop {
            if !self.running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return None;
            }
            match self.stream.read(&mut byte) {
                // Connection closed; pace the loop and let the scan
                // counter starve the flag.
                Ok(0) => thread::sleep(READ_POLL),
                Ok(_) if byte[0] == SYNC_BYTE => break,
                Ok(_) => debug!(byte = byte[0], "discarding byte while resyncing"),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => thread::sleep(READ_POLL),
            }
        }

        let mut body = [0u8; TIMING_DATAGRAM_SIZE - 1];
        let mut got = 0usize;
        while got < body.len() {
            if !self.running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return None;
            }
            match self.stream.read(&mut body[got..]) {
                Ok(0) => thread::sleep(READ_POLL),
                Ok(n) => got += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => thread::sleep(READ_POLL),
            }
        }

        TimingDatagram::parse_body(&body).ok()
    }

    fn handle_timing(&mut self, timing: TimingDatagram, no_valid: &mut u32) {
        let last = self.stats.last_sequence();
        let age = last.wrapping_sub(timing.sequence);

        if age < self.age_window {
            *no_valid = 0;
            if !self.flags.audio_comms_connected() {
                info!("audio link confirmed by timing datagram");
            }
            self.flags.set_audio(true);

            let delay_us = unix_micros() as i64 - timing.timestamp_us as i64;
            self.stats.record_round_trip(delay_us);
            self.hooks.notify_round_trip(delay_us);
            debug!(sequence = timing.sequence, delay_us, "round trip measured");
        } else {
            // A stale echo means the transport is buffering faster than
            // it delivers; the session needs a restart.
            warn!(age, sequence = timing.sequence, "stale timing datagram");
            self.stats.record_stale_timing();
            self.flags.set_audio(false);
            *no_valid = 0;
        }
    }
}
