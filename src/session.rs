//! Session supervisor
//!
//! One session is one bring-up of the whole pipeline: resolve the
//! server, open and configure the uplink socket, then run the liveness
//! monitor, the capture-encode stage and the send stage on their own
//! threads. The supervisor owns the socket and all session state; the
//! stages borrow through shared handles. [`run`] wraps sessions in the
//! reconnection loop: every second it checks the liveness flag and
//! tears the session down for a fresh start when the link is gone.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use tracing::{debug, error, info, warn};

use crate::audio::CaptureSource;
use crate::codec::ring::{DatagramRing, RingHooks};
use crate::codec::UrtpEncoder;
use crate::config::StreamConfig;
use crate::error::{AudioError, Result};
use crate::events::StreamHooks;
use crate::network::monitor::LivenessMonitor;
use crate::network::sender::SendStage;
use crate::network::socket;
use crate::stats::SessionStats;

/// Connection state shared across the session threads.
///
/// `tcp_connected` is transport-level: the socket is open and
/// configured. `audio_comms_connected` is application-level: the server
/// has recently confirmed delivery through a timing datagram. Only the
/// liveness monitor flips the latter.
#[derive(Debug, Default)]
pub struct LinkFlags {
    tcp: AtomicBool,
    audio: AtomicBool,
}

impl LinkFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tcp_connected(&self) -> bool {
        self.tcp.load(Ordering::Relaxed)
    }

    pub fn audio_comms_connected(&self) -> bool {
        self.audio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tcp(&self, value: bool) {
        self.tcp.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_audio(&self, value: bool) {
        self.audio.store(value, Ordering::Relaxed);
    }
}

/// A running streaming session.
pub struct Session {
    running: Arc<AtomicBool>,
    flags: Arc<LinkFlags>,
    stats: Arc<SessionStats>,
    ring: Arc<DatagramRing>,
    stream: TcpStream,
    /// Spawn order: monitor, capture-encode, send. Joined in reverse.
    threads: Vec<JoinHandle<()>>,
}

impl Session {
    /// Resolve, connect and launch the pipeline.
    ///
    /// Returns once the stages are running. The server link may or may
    /// not be confirmed yet: the call waits up to
    /// `server_link_establishment_wait_s` pumping the watchdog, then
    /// returns either way and leaves the decision to the caller's
    /// supervision tick.
    pub fn start(
        config: &StreamConfig,
        source: Box<dyn CaptureSource>,
        hooks: Arc<StreamHooks>,
    ) -> Result<Session> {
        config.validate()?;
        let stats = Arc::new(SessionStats::new());
        let flags = Arc::new(LinkFlags::new());

        let addr = socket::resolve(&config.server)?;
        let stream = socket::connect(addr, config)?;
        flags.set_tcp(true);

        // The bounded channel doubles as the counting "datagram ready"
        // signal for the send stage.
        let (ready_tx, ready_rx) = bounded::<()>(config.max_num_datagrams);
        let ring_hooks = RingHooks {
            ready: Some(Box::new({
                let hooks = hooks.clone();
                move |index| {
                    let _ = ready_tx.try_send(());
                    hooks.notify_datagram_ready(index);
                }
            })),
            overflow_start: Some(Box::new({
                let hooks = hooks.clone();
                move || hooks.notify_overflow_start()
            })),
            overflow_stop: Some(Box::new({
                let hooks = hooks.clone();
                let stats = stats.clone();
                move |count| {
                    stats.record_ring_overflows(count as u64);
                    hooks.notify_overflow_stop(count);
                }
            })),
        };
        let ring = Arc::new(DatagramRing::new(
            config.max_num_datagrams,
            config.datagram_size(),
            ring_hooks,
        ));
        let encoder = UrtpEncoder::new(config, ring.clone(), stats.clone())?;

        // Clone the socket handles up front so a failure leaves nothing
        // half-started.
        let monitor_stream = stream.try_clone()?;
        let send_stream = stream.try_clone()?;

        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        let monitor = LivenessMonitor {
            stream: monitor_stream,
            running: running.clone(),
            flags: flags.clone(),
            hooks: hooks.clone(),
            stats: stats.clone(),
            age_window: config.timing_age_window(),
            wait_scans: config.timing_datagram_wait_s,
        };
        threads.push(
            thread::Builder::new()
                .name("liveness-monitor".to_string())
                .spawn(move || monitor.run())?,
        );

        let words_per_block = config.samples_per_block() * 2;
        threads.push({
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("capture-encode".to_string())
                .spawn(move || capture_encode_loop(source, encoder, words_per_block, running, stats))?
        });

        let stage = SendStage {
            stream: send_stream,
            ring: ring.clone(),
            ready: ready_rx,
            running: running.clone(),
            flags: flags.clone(),
            hooks: hooks.clone(),
            stats: stats.clone(),
            send_deadline: Duration::from_millis(config.tcp_send_timeout_ms),
            max_bad_run: Duration::from_millis(config.max_duration_socket_errors_ms),
            run_anyway: Duration::from_secs(config.send_run_anyway_time_s),
            block_duration_ms: config.block_duration_ms as u64,
        };
        threads.push(
            thread::Builder::new()
                .name("send".to_string())
                .spawn(move || stage.run())?,
        );

        let wait_deadline =
            Instant::now() + Duration::from_secs(config.server_link_establishment_wait_s);
        while Instant::now() < wait_deadline && !flags.audio_comms_connected() {
            hooks.kick_watchdog();
            thread::sleep(Duration::from_millis(100));
        }
        if flags.audio_comms_connected() {
            info!("audio link established");
        } else {
            warn!("audio link not yet confirmed; supervision will decide");
        }

        Ok(Session {
            running,
            flags,
            stats,
            ring,
            stream,
            threads,
        })
    }

    /// Application-level link state: the server has recently confirmed
    /// delivery.
    pub fn is_streaming(&self) -> bool {
        self.flags.audio_comms_connected()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Datagrams currently queued in the ring.
    pub fn queued_datagrams(&self) -> usize {
        self.ring.available()
    }

    /// Stop the stages, error out pending socket operations, and join
    /// the threads in reverse spawn order.
    pub fn stop(mut self) {
        info!("stopping session");
        self.running.store(false, Ordering::Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);
        while let Some(handle) = self.threads.pop() {
            let _ = handle.join();
        }
        self.flags.set_audio(false);
        self.flags.set_tcp(false);
        info!("session stopped");
    }
}

/// Capture and encode run in lockstep on one thread: the blocking
/// device read paces the encoder.
fn capture_encode_loop(
    mut source: Box<dyn CaptureSource>,
    mut encoder: UrtpEncoder,
    words_per_block: usize,
    running: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
) {
    let frames_per_block = words_per_block / 2;
    let mut raw = vec![0u32; words_per_block];

    while running.load(Ordering::Relaxed) {
        match source.read_block(&mut raw) {
            Err(AudioError::Overrun) => {
                stats.record_overrun();
                warn!("capture overrun; resetting device");
                if let Err(e) = source.prepare() {
                    error!(error = %e, "capture recovery failed");
                }
            }
            Err(e) => {
                stats.record_device_error();
                error!(error = %e, "capture read failed");
                thread::sleep(Duration::from_millis(100));
            }
            Ok(frames) if frames != frames_per_block => {
                // Partial block: count it and drop the data.
                stats.record_underrun();
            }
            Ok(_) => {
                if let Err(e) = encoder.code_audio_block(&raw) {
                    error!(error = %e, "encode failed");
                }
            }
        }
    }
}

/// Reconnection loop: keep a session alive until `stop` is raised.
///
/// Capture sources are per-session, so a factory opens a fresh one for
/// each bring-up. Resolve/connect/open failures retry after a second
/// with the watchdog fed; a session whose liveness flag drops is torn
/// down and rebuilt.
pub fn run<F>(
    config: &StreamConfig,
    mut source_factory: F,
    hooks: Arc<StreamHooks>,
    stop: &AtomicBool,
) -> Result<()>
where
    F: FnMut() -> Result<Box<dyn CaptureSource>>,
{
    config.validate()?;

    while !stop.load(Ordering::Relaxed) {
        let source = match source_factory() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "cannot open capture source");
                hooks.kick_watchdog();
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let session = match Session::start(config, source, hooks.clone()) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "session start failed");
                hooks.kick_watchdog();
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let mut last_bytes = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                session.stop();
                return Ok(());
            }
            thread::sleep(Duration::from_secs(1));
            hooks.kick_watchdog();

            let bytes = session.stats().bytes_sent();
            if bytes > last_bytes {
                debug!(
                    throughput_bits_s = (bytes - last_bytes) * 8,
                    queued = session.queued_datagrams(),
                    "streaming"
                );
                last_bytes = bytes;
            }

            if !session.is_streaming() {
                warn!("audio link down; tearing down for reconnect");
                session.stop();
                break;
            }
        }
    }
    Ok(())
}
