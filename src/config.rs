//! Stream configuration
//!
//! Every tunable of the pipeline lives here with its default. A config
//! can be loaded from a TOML file or built in code; `validate()` must
//! pass before a session is started.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Error, Result};
use crate::protocol::{AudioCoding, URTP_HEADER_SIZE};

/// Coded sample width for UNICAM. Only this value is supported.
pub const UNICAM_CODED_SAMPLE_SIZE_BITS: u32 = 8;

/// Maximum size a decoded UNICAM sample should reach.
pub const UNICAM_MAX_DECODED_SAMPLE_SIZE_BITS: u32 = 16;

/// Complete configuration for one streaming client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Capture device name ("default" for the system default input).
    pub device_name: String,

    /// Audio server as `host:port`.
    pub server: String,

    /// Capture sample rate in Hz. Must be a multiple of 1000.
    pub sampling_frequency: u32,

    /// Amount of audio coded into one datagram, in milliseconds.
    pub block_duration_ms: u32,

    /// Number of datagram containers in the ring; old datagrams are
    /// overwritten when the sender falls this far behind.
    pub max_num_datagrams: usize,

    /// Audio coding scheme for the body.
    pub coding: AudioCoding,

    /// Maximum gain shift the conditioner may apply (0..=12).
    pub audio_max_shift_bits: u32,

    /// Headroom the gain control aims to keep, in bits.
    pub desired_unused_bits: i32,

    /// Hysteresis on gain increases, in bits.
    pub shift_hysteresis_bits: i32,

    /// Consecutive up-shift indications required before gain really
    /// increases by one bit.
    pub up_shifts_for_a_shift: u32,

    /// Samples with absolute value at or below this are not shifted.
    pub audio_shift_threshold: i32,

    /// Coded sample width for UNICAM; only 8 is supported.
    pub unicam_coded_sample_size_bits: u32,

    /// Decoded sample ceiling for UNICAM; only 16 is supported.
    pub unicam_max_decoded_sample_size_bits: u32,

    /// Wall-clock deadline for sending one datagram, in milliseconds.
    pub tcp_send_timeout_ms: u64,

    /// A run of consecutive send failures longer than this is reported
    /// as the socket having gone bad.
    pub max_duration_socket_errors_ms: u64,

    /// Kernel send buffer size (SO_SNDBUF), kept small to minimise
    /// queuing latency.
    pub tcp_buffer_size_bytes: usize,

    /// How long the supervisor waits for the server link to come up.
    pub server_link_establishment_wait_s: u64,

    /// A timing datagram echoing a sequence number older than this many
    /// seconds of audio is stale.
    pub timing_datagram_age_s: u64,

    /// Scans (roughly one per second) without a valid timing datagram
    /// before the link is considered lost.
    pub timing_datagram_wait_s: u32,

    /// The send stage wakes at least this often so the stop signal is
    /// polled even when no datagrams arrive.
    pub send_run_anyway_time_s: u64,

    /// Diagnostic tap: write the conditioned mono stream to this file as
    /// little-endian signed 32-bit samples. Off by default.
    pub audio_tap_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device_name: "default".to_string(),
            server: String::new(),
            sampling_frequency: 16_000,
            block_duration_ms: 20,
            max_num_datagrams: 250,
            coding: AudioCoding::UnicamCompressed8Bit,
            audio_max_shift_bits: 12,
            desired_unused_bits: 4,
            shift_hysteresis_bits: 3,
            up_shifts_for_a_shift: 500,
            audio_shift_threshold: 0,
            unicam_coded_sample_size_bits: UNICAM_CODED_SAMPLE_SIZE_BITS,
            unicam_max_decoded_sample_size_bits: UNICAM_MAX_DECODED_SAMPLE_SIZE_BITS,
            tcp_send_timeout_ms: 1500,
            max_duration_socket_errors_ms: 3000,
            tcp_buffer_size_bytes: 25_000,
            server_link_establishment_wait_s: 5,
            timing_datagram_age_s: 15,
            timing_datagram_wait_s: 5,
            send_run_anyway_time_s: 2,
            audio_tap_path: None,
        }
    }
}

impl StreamConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StreamConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for unsupported or degenerate values.
    pub fn validate(&self) -> Result<()> {
        if self.unicam_coded_sample_size_bits != UNICAM_CODED_SAMPLE_SIZE_BITS {
            return Err(
                CodecError::UnsupportedCodedSampleSize(self.unicam_coded_sample_size_bits).into(),
            );
        }
        if self.unicam_max_decoded_sample_size_bits != UNICAM_MAX_DECODED_SAMPLE_SIZE_BITS {
            return Err(CodecError::UnsupportedDecodedSampleSize(
                self.unicam_max_decoded_sample_size_bits,
            )
            .into());
        }
        if self.sampling_frequency == 0 || self.sampling_frequency % 1000 != 0 {
            return Err(Error::Config(format!(
                "sampling_frequency must be a non-zero multiple of 1000, got {}",
                self.sampling_frequency
            )));
        }
        if self.block_duration_ms == 0 {
            return Err(Error::Config("block_duration_ms must be non-zero".into()));
        }
        if self.max_num_datagrams < 2 {
            return Err(Error::Config(format!(
                "max_num_datagrams must be at least 2, got {}",
                self.max_num_datagrams
            )));
        }
        if self.audio_max_shift_bits > 12 {
            return Err(Error::Config(format!(
                "audio_max_shift_bits must be in 0..=12, got {}",
                self.audio_max_shift_bits
            )));
        }
        Ok(())
    }

    /// Stereo frames per block.
    pub fn samples_per_block(&self) -> usize {
        (self.sampling_frequency * self.block_duration_ms / 1000) as usize
    }

    /// Mono samples per UNICAM sub-block (1 ms of audio).
    pub fn samples_per_unicam_block(&self) -> usize {
        (self.sampling_frequency / 1000) as usize
    }

    /// UNICAM sub-blocks per block.
    pub fn unicam_blocks_per_block(&self) -> usize {
        self.samples_per_block() / self.samples_per_unicam_block()
    }

    /// Body size in bytes for the configured coding.
    pub fn body_size(&self) -> usize {
        match self.coding {
            AudioCoding::PcmSigned16Bit => 2 * self.samples_per_block(),
            AudioCoding::UnicamCompressed8Bit => {
                let per_sub_block = self.samples_per_unicam_block();
                let blocks = self.unicam_blocks_per_block();
                // Each pair of sub-blocks shares one shift byte; an odd
                // trailing sub-block still needs its own.
                (blocks / 2) * (2 * per_sub_block + 1) + (blocks % 2) * (per_sub_block + 1)
            }
        }
    }

    /// Total datagram size in bytes, header included.
    pub fn datagram_size(&self) -> usize {
        URTP_HEADER_SIZE + self.body_size()
    }

    /// Number of recent datagrams a timing echo may refer to before it
    /// counts as stale.
    pub fn timing_age_window(&self) -> u16 {
        let window = self.timing_datagram_age_s * 1000 / self.block_duration_ms as u64;
        window.min(u16::MAX as u64 / 2) as u16
    }
}
