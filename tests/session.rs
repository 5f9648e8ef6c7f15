//! End-to-end session tests over loopback TCP.
//!
//! A scripted capture source feeds silence into a real session while a
//! scripted server consumes the uplink and plays the timing-datagram
//! side of the protocol: echoing fresh sequence numbers, echoing stale
//! ones, or staying silent.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use urtp_streamer::audio::CaptureSource;
use urtp_streamer::error::AudioError;
use urtp_streamer::protocol::{TimingDatagram, UrtpHeader, URTP_HEADER_SIZE};
use urtp_streamer::{session, Session, StreamConfig, StreamHooks};

/// Produces endless blocks of silence at an accelerated pace.
struct ScriptedCapture {
    pace: Duration,
}

impl CaptureSource for ScriptedCapture {
    fn read_block(&mut self, words: &mut [u32]) -> Result<usize, AudioError> {
        thread::sleep(self.pace);
        words.fill(0);
        Ok(words.len() / 2)
    }

    fn prepare(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

const MODE_ECHO: u8 = 0;
const MODE_STALE: u8 = 1;
const MODE_SILENT: u8 = 2;

#[derive(Debug, Clone, Default)]
struct ReceivedDatagram {
    sequence: u16,
    len: usize,
    body_is_zero: bool,
}

struct ScriptedServer {
    addr: SocketAddr,
    mode: Arc<AtomicU8>,
    received: Arc<Mutex<Vec<ReceivedDatagram>>>,
    accepts: Arc<AtomicUsize>,
}

impl ScriptedServer {
    fn start(mode: u8) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mode = Arc::new(AtomicU8::new(mode));
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepts = Arc::new(AtomicUsize::new(0));

        {
            let mode = mode.clone();
            let received = received.clone();
            let accepts = accepts.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    accepts.fetch_add(1, Ordering::SeqCst);
                    serve_connection(stream, &mode, &received);
                }
            });
        }

        Self {
            addr,
            mode,
            received,
            accepts,
        }
    }

    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

fn serve_connection(
    mut stream: TcpStream,
    mode: &AtomicU8,
    received: &Mutex<Vec<ReceivedDatagram>>,
) {
    let mut header_buf = [0u8; URTP_HEADER_SIZE];
    let mut body = vec![0u8; 65536];

    loop {
        if stream.read_exact(&mut header_buf).is_err() {
            return;
        }
        let Ok(header) = UrtpHeader::parse(&header_buf) else {
            return;
        };
        let body_len = header.body_len as usize;
        if stream.read_exact(&mut body[..body_len]).is_err() {
            return;
        }

        received.lock().unwrap().push(ReceivedDatagram {
            sequence: header.sequence,
            len: URTP_HEADER_SIZE + body_len,
            body_is_zero: body[..body_len].iter().all(|&b| b == 0),
        });

        let timing = match mode.load(Ordering::SeqCst) {
            MODE_ECHO => Some(TimingDatagram {
                sequence: header.sequence,
                timestamp_us: header.timestamp_us,
            }),
            MODE_STALE => Some(TimingDatagram {
                sequence: header.sequence.wrapping_sub(1000),
                timestamp_us: header.timestamp_us,
            }),
            _ => None,
        };
        if let Some(timing) = timing {
            if stream.write_all(&timing.encode()).is_err() {
                return;
            }
        }
    }
}

fn test_config(server: &ScriptedServer) -> StreamConfig {
    StreamConfig {
        server: server.addr.to_string(),
        timing_datagram_wait_s: 2,
        server_link_establishment_wait_s: 3,
        send_run_anyway_time_s: 1,
        ..Default::default()
    }
}

fn scripted_source() -> Box<dyn CaptureSource> {
    Box::new(ScriptedCapture {
        pace: Duration::from_millis(5),
    })
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn clean_session_streams_contiguous_datagrams() {
    let server = ScriptedServer::start(MODE_ECHO);
    let config = test_config(&server);

    let session = Session::start(&config, scripted_source(), Arc::new(StreamHooks::new())).unwrap();

    // The first fresh echo confirms the link.
    assert!(session.is_streaming());
    assert!(wait_for(|| server.received_count() >= 50, Duration::from_secs(10)));

    // Snapshot before teardown: shutdown can interrupt an in-flight
    // send and record a failure that is not part of the clean run.
    let snap = session.stats().snapshot();
    session.stop();

    let received = server.received.lock().unwrap();
    for (expected, datagram) in received.iter().take(50).enumerate() {
        assert_eq!(datagram.sequence, expected as u16);
        assert_eq!(datagram.len, 344);
        assert!(datagram.body_is_zero, "silence must encode to zeros");
    }

    assert!(snap.datagrams_sent >= 50);
    assert_eq!(snap.send_failures, 0);
    assert!(snap.last_round_trip_us >= 0);
}

#[test]
fn stale_timing_never_confirms_the_link() {
    let server = ScriptedServer::start(MODE_STALE);
    let config = test_config(&server);

    let session = Session::start(&config, scripted_source(), Arc::new(StreamHooks::new())).unwrap();

    // Uplink flows, but every echo is 1000 datagrams old (window 750).
    assert!(wait_for(|| server.received_count() >= 10, Duration::from_secs(10)));
    assert!(!session.is_streaming());

    let stats = session.stats();
    assert!(wait_for(
        || stats.snapshot().stale_timings >= 1,
        Duration::from_secs(5)
    ));
    session.stop();
}

#[test]
fn missing_timing_keeps_the_link_down() {
    let server = ScriptedServer::start(MODE_SILENT);
    let config = test_config(&server);

    let session = Session::start(&config, scripted_source(), Arc::new(StreamHooks::new())).unwrap();

    // Datagrams still go out; the link is never confirmed.
    assert!(wait_for(|| server.received_count() >= 10, Duration::from_secs(10)));
    assert!(!session.is_streaming());

    let stats = session.stats();
    assert!(wait_for(
        || stats.snapshot().timing_timeouts >= 1,
        Duration::from_secs(8)
    ));
    session.stop();
}

#[test]
fn supervision_loop_reconnects_after_link_loss() {
    let server = ScriptedServer::start(MODE_ECHO);
    let config = test_config(&server);

    let streamed = Arc::new(AtomicUsize::new(0));
    let hooks = Arc::new(StreamHooks::new().with_now_streaming({
        let streamed = streamed.clone();
        move || {
            streamed.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let stop = Arc::new(AtomicBool::new(false));
    let runner = {
        let config = config.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            session::run(
                &config,
                || Ok(scripted_source()),
                hooks,
                &stop,
            )
            .unwrap()
        })
    };

    // Phase 1: streaming confirmed.
    assert!(wait_for(
        || streamed.load(Ordering::SeqCst) > 10,
        Duration::from_secs(10)
    ));
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);

    // Phase 2: the server goes quiet; the loop must tear down and
    // reconnect.
    server.mode.store(MODE_SILENT, Ordering::SeqCst);
    assert!(wait_for(
        || server.accepts.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(20)
    ));

    // Phase 3: timing comes back on the new connection and streaming
    // resumes.
    server.mode.store(MODE_ECHO, Ordering::SeqCst);
    let before = streamed.load(Ordering::SeqCst);
    assert!(wait_for(
        || streamed.load(Ordering::SeqCst) > before + 10,
        Duration::from_secs(15)
    ));

    stop.store(true, Ordering::SeqCst);
    runner.join().unwrap();
}
