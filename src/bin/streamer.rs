//! Streaming client application
//!
//! Captures from the named device and streams URTP datagrams at the
//! server until killed, reconnecting whenever the link drops.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use urtp_streamer::audio::{list_input_devices, CaptureSource, CpalCapture};
use urtp_streamer::{session, StreamConfig, StreamHooks};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = match std::env::args().nth(1) {
        Some(server) => server,
        None => bail!("usage: streamer <server:port> [device-name] [config.toml]"),
    };
    let device_name = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "default".to_string());

    let mut config = match std::env::args().nth(3) {
        Some(path) => StreamConfig::from_file(Path::new(&path))?,
        None => StreamConfig::default(),
    };
    config.server = server;
    config.device_name = device_name.clone();
    config.validate()?;

    println!("\n=== Available Input Devices ===");
    for name in list_input_devices() {
        println!("  {name}");
    }
    println!();

    tracing::info!(
        server = %config.server,
        device = %config.device_name,
        datagram_size = config.datagram_size(),
        "starting streaming client"
    );

    let hooks = Arc::new(StreamHooks::new().with_round_trip(|delay_us| {
        tracing::debug!(delay_us, "round trip");
    }));

    let sampling_frequency = config.sampling_frequency;
    let stop = AtomicBool::new(false);
    session::run(
        &config,
        move || {
            let capture = CpalCapture::open(&device_name, sampling_frequency)?;
            Ok(Box::new(capture) as Box<dyn CaptureSource>)
        },
        hooks,
        &stop,
    )?;
    Ok(())
}
