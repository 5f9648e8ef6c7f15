//! # URTP Streamer
//!
//! Embedded audio streaming client: captures stereo PCM from a local
//! device, compresses each 20 ms block with a NICAM-like codec and
//! streams the datagrams to a server over TCP, while a server-originated
//! timing channel confirms end-to-end delivery and measures round-trip
//! delay.
//!
//! ```text
//!  ┌─────────┐   ┌──────────────┐   ┌───────────────┐   ┌────────┐
//!  │ Capture │──▶│ URTP encoder │──▶│ Datagram ring │──▶│  Send  │──▶ TCP
//!  │ device  │   │ (AGC+FIR+    │   │ (250 × 344 B) │   │ stage  │
//!  └─────────┘   │  UNICAM)     │   └───────────────┘   └────────┘
//!                └──────────────┘                            ▲
//!                                   ┌────────────────────┐   │
//!                        TCP ──────▶│  Liveness monitor  │───┘ streaming flag
//!                                   │ (timing datagrams) │
//!                                   └────────────────────┘
//! ```
//!
//! Capture and encode share a thread (the blocking device read paces the
//! encoder); the send stage and the liveness monitor run on their own.
//! The session supervisor owns the socket, launches the stages and
//! rebuilds everything when the liveness flag drops.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;
pub mod session;
pub mod stats;

pub use config::StreamConfig;
pub use error::{Error, Result};
pub use events::StreamHooks;
pub use session::{run, Session};

/// Application-wide constants
pub mod constants {
    /// Default capture sample rate
    pub const DEFAULT_SAMPLING_FREQUENCY: u32 = 16_000;

    /// Default audio block duration
    pub const DEFAULT_BLOCK_DURATION_MS: u32 = 20;

    /// Default depth of the datagram ring (about 5 seconds of audio)
    pub const DEFAULT_MAX_NUM_DATAGRAMS: usize = 250;

    /// Datagram size with the default geometry and UNICAM coding
    pub const DEFAULT_URTP_DATAGRAM_SIZE: usize = 344;
}
