//! Send stage
//!
//! Drains ready datagrams from the ring and writes them to the uplink.
//! Each datagram gets a wall-clock deadline on top of the kernel send
//! timeout; short writes loop until the deadline. A failed datagram is
//! left in the ring so it survives a reconnect. The stage never tears
//! the session down itself: it records bad runs and fatal socket errors
//! and leaves recovery to the liveness flag.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::codec::ring::DatagramRing;
use crate::error::NetworkError;
use crate::events::StreamHooks;
use crate::session::LinkFlags;
use crate::stats::SessionStats;

/// Sleep per cycle while the transport is down.
const DISCONNECTED_IDLE: Duration = Duration::from_secs(1);

pub(crate) struct SendStage {
    pub stream: TcpStream,
    pub ring: Arc<DatagramRing>,
    pub ready: Receiver<()>,
    pub running: Arc<AtomicBool>,
    pub flags: Arc<LinkFlags>,
    pub hooks: Arc<StreamHooks>,
    pub stats: Arc<SessionStats>,
    pub send_deadline: Duration,
    pub max_bad_run: Duration,
    pub run_anyway: Duration,
    pub block_duration_ms: u64,
}

impl SendStage {
    pub(crate) fn run(mut self) {
        // Start of the current run of consecutive send failures.
        let mut bad_run: Option<Instant> = None;

        while self.running.load(Ordering::Relaxed) {
            // Wait for a datagram, but wake at least every run_anyway
            // interval so the stop signal is polled.
            let _ = self.ready.recv_timeout(self.run_anyway);
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            if !self.flags.tcp_connected() {
                thread::sleep(DISCONNECTED_IDLE);
                self.hooks.kick_watchdog();
                continue;
            }

            self.drain(&mut bad_run);
            self.hooks.kick_watchdog();
        }
    }

    fn drain(&mut self, bad_run: &mut Option<Instant>) {
        while self.running.load(Ordering::Relaxed) {
            let Some(lease) = self.ring.begin_read() else {
                break;
            };
            let len = lease.len;

            let start = Instant::now();
            let result = self.send_datagram(&lease.buf[..len]);
            let duration_ms = start.elapsed().as_millis() as u64;
            if self
                .stats
                .record_send_duration(duration_ms, self.block_duration_ms)
                .is_some()
            {
                debug!(duration_ms, "new peak datagram send duration");
            }

            match result {
                Ok(()) => {
                    *bad_run = None;
                    self.stats.record_sent(len);
                    self.ring.finish_read(lease);
                    self.hooks.kick_watchdog();
                    if self.flags.audio_comms_connected() {
                        self.hooks.notify_streaming();
                    }
                }
                Err(e) => {
                    let fatal = e.is_fatal_socket();
                    self.stats.record_send_failure(fatal);
                    warn!(error = %e, "datagram send failed");

                    match *bad_run {
                        None => *bad_run = Some(Instant::now()),
                        Some(started) => {
                            if started.elapsed() > self.max_bad_run {
                                warn!(
                                    duration_ms = started.elapsed().as_millis() as u64,
                                    "socket errors for too long"
                                );
                            }
                        }
                    }
                    if fatal {
                        warn!(error = %e, "socket bad");
                    }

                    // Keep the datagram for the next connection; the
                    // liveness monitor owns the recovery decision.
                    self.ring.abort_read(lease);
                    break;
                }
            }
        }
    }

    /// Write one datagram in full within the wall-clock deadline.
    ///
    /// The kernel send timeout slices the blocking writes; each slice
    /// that expires loops back until the deadline. The Rust runtime
    /// masks SIGPIPE, so a broken pipe surfaces as an error return.
    fn send_datagram(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        let deadline = Instant::now() + self.send_deadline;
        let mut sent = 0usize;

        while sent < data.len() && Instant::now() < deadline {
            match self.stream.write(&data[sent..]) {
                Ok(0) => {
                    return Err(NetworkError::Send(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => sent += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(NetworkError::Send(e)),
            }
        }

        if sent < data.len() {
            warn!(remaining = data.len() - sent, "send deadline expired");
            Err(NetworkError::SendTimeout {
                remaining: data.len() - sent,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ring::RingHooks;
    use crossbeam_channel::bounded;
    use std::io::Read;
    use std::net::TcpListener;

    fn stage_over_loopback() -> (SendStage, TcpStream, crossbeam_channel::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let (ready_tx, ready_rx) = bounded(16);
        let flags = Arc::new(LinkFlags::new());
        flags.set_tcp(true);
        let stage = SendStage {
            stream: client,
            ring: Arc::new(DatagramRing::new(8, 32, RingHooks::default())),
            ready: ready_rx,
            running: Arc::new(AtomicBool::new(true)),
            flags,
            hooks: Arc::new(StreamHooks::new()),
            stats: Arc::new(SessionStats::new()),
            send_deadline: Duration::from_millis(1500),
            max_bad_run: Duration::from_millis(3000),
            run_anyway: Duration::from_millis(100),
            block_duration_ms: 20,
        };
        (stage, server, ready_tx)
    }

    #[test]
    fn datagrams_arrive_in_order_and_release_containers() {
        let (stage, mut server, ready_tx) = stage_over_loopback();
        let ring = stage.ring.clone();
        let running = stage.running.clone();
        let stats = stage.stats.clone();

        for tag in 0..4u8 {
            let mut lease = ring.begin_write();
            lease.buf[..4].copy_from_slice(&[tag; 4]);
            ring.finish_write(lease, 4);
            ready_tx.send(()).unwrap();
        }

        let handle = thread::spawn(move || stage.run());

        let mut received = [0u8; 16];
        server.read_exact(&mut received).unwrap();
        for (n, chunk) in received.chunks_exact(4).enumerate() {
            assert_eq!(chunk, &[n as u8; 4]);
        }

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(ring.free(), ring.capacity());
        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_sent, 4);
        assert_eq!(snap.bytes_sent, 16);
        assert_eq!(snap.send_failures, 0);
    }

    #[test]
    fn failed_send_keeps_the_datagram() {
        let (mut stage, _server, _ready_tx) = stage_over_loopback();
        // Shut our own write side down so the next write fails with a
        // broken pipe, deterministically.
        stage.stream.shutdown(std::net::Shutdown::Both).unwrap();
        stage.send_deadline = Duration::from_millis(200);

        let ring = stage.ring.clone();
        let mut lease = ring.begin_write();
        lease.buf[0] = 0x77;
        ring.finish_write(lease, 1);

        let mut bad_run = None;
        stage.drain(&mut bad_run);

        let snap = stage.stats.snapshot();
        assert_eq!(snap.send_failures, 1);
        assert_eq!(snap.fatal_socket_errors, 1);
        assert!(bad_run.is_some());
        // The datagram is still in the ring, waiting for a reconnect.
        assert_eq!(ring.available(), 1);
        let lease = ring.begin_read().expect("datagram must survive");
        assert_eq!(lease.buf[0], 0x77);
        ring.finish_read(lease);
    }
}
