//! URTP encoder
//!
//! Takes blocks of Philips I2S protocol samples (24-bit frames carried
//! in the upper bytes of 32-bit words, stereo interleaved) and encodes
//! them into URTP datagrams: a 14-byte header plus either big-endian
//! 16-bit PCM or NICAM-like 8-bit UNICAM audio. Only the left channel
//! (the even words) is used.
//!
//! UNICAM coding takes 1 ms of audio at a time, finds the peak, shifts
//! every sample of the sub-block down so it fits in 8 bits and stores
//! the shift in one nibble. Two consecutive sub-blocks share a shift
//! byte, the even sub-block in the low nibble and the odd one in the
//! high nibble.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::agc::GainController;
use crate::codec::fir::Preemphasis;
use crate::codec::ring::DatagramRing;
use crate::config::{
    StreamConfig, UNICAM_CODED_SAMPLE_SIZE_BITS, UNICAM_MAX_DECODED_SAMPLE_SIZE_BITS,
};
use crate::error::CodecError;
use crate::protocol::{unix_micros, AudioCoding, UrtpHeader, URTP_HEADER_SIZE};
use crate::stats::SessionStats;

/// Encodes audio blocks into datagram containers from the ring.
pub struct UrtpEncoder {
    coding: AudioCoding,
    samples_per_block: usize,
    samples_per_unicam_block: usize,
    agc: GainController,
    preemphasis: Preemphasis,
    unicam_buffer: Vec<i32>,
    sequence: u16,
    ring: Arc<DatagramRing>,
    stats: Arc<SessionStats>,
    tap: Option<BufWriter<File>>,
}

impl UrtpEncoder {
    /// Build an encoder. Fails if this target does not right-shift
    /// negative integers arithmetically, which UNICAM depends on.
    pub fn new(
        config: &StreamConfig,
        ring: Arc<DatagramRing>,
        stats: Arc<SessionStats>,
    ) -> Result<Self, CodecError> {
        if !arithmetic_shift_supported() {
            return Err(CodecError::ArithmeticShift);
        }
        if config.unicam_coded_sample_size_bits != UNICAM_CODED_SAMPLE_SIZE_BITS {
            return Err(CodecError::UnsupportedCodedSampleSize(
                config.unicam_coded_sample_size_bits,
            ));
        }

        let tap = config.audio_tap_path.as_ref().and_then(|path| {
            match File::create(path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open audio tap");
                    None
                }
            }
        });

        Ok(Self {
            coding: config.coding,
            samples_per_block: config.samples_per_block(),
            samples_per_unicam_block: config.samples_per_unicam_block(),
            agc: GainController::new(config),
            preemphasis: Preemphasis::new(),
            unicam_buffer: vec![0; config.samples_per_unicam_block()],
            sequence: 0,
            ring,
            stats,
            tap,
        })
    }

    /// Encode one block of raw stereo audio into the next writable
    /// container and mark it ready to read.
    pub fn code_audio_block(&mut self, raw_audio: &[u32]) -> Result<(), CodecError> {
        let expected = self.samples_per_block * 2;
        if raw_audio.len() != expected {
            return Err(CodecError::InvalidBlockLength {
                expected,
                got: raw_audio.len(),
            });
        }

        let timestamp_us = unix_micros();
        let mut lease = self.ring.begin_write();

        let body_len = match self.coding {
            AudioCoding::UnicamCompressed8Bit => {
                self.code_unicam(raw_audio, &mut lease.buf[URTP_HEADER_SIZE..])
            }
            AudioCoding::PcmSigned16Bit => {
                self.code_pcm(raw_audio, &mut lease.buf[URTP_HEADER_SIZE..])
            }
        };

        let header = UrtpHeader {
            coding: self.coding,
            sequence: self.sequence,
            timestamp_us,
            body_len: body_len as u16,
        };
        header.write_to(&mut lease.buf[..URTP_HEADER_SIZE]);

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.stats.record_block_encoded(sequence);
        debug!(sequence, body_len, "datagram encoded");

        self.ring.finish_write(lease, URTP_HEADER_SIZE + body_len);
        Ok(())
    }

    /// Sequence number the next datagram will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    fn code_unicam(&mut self, raw_audio: &[u32], body: &mut [u8]) -> usize {
        let sub_block = self.samples_per_unicam_block;
        let mut pos = 0usize;
        let mut shift_byte_pos = 0usize;
        let mut block_index = 0usize;
        let mut max_abs: i32 = 0;
        let mut fill = 0usize;

        for frame in raw_audio.chunks_exact(2) {
            let mono = self.agc.process(mono_sample(frame[0]));
            // Scale down to the largest value the decoder should derive.
            let mono = mono >> (32 - UNICAM_MAX_DECODED_SAMPLE_SIZE_BITS);

            self.preemphasis.put(mono as f64);
            let sample = self.preemphasis.get() as i32;
            self.tap_sample(sample);

            max_abs = max_abs.max(sample.abs());
            self.unicam_buffer[fill] = sample;
            fill += 1;
            if fill < sub_block {
                continue;
            }
            fill = 0;

            let shift = shift_for(max_abs);
            max_abs = 0;

            let even = block_index % 2 == 0;
            if !even {
                // The previous even sub-block left the cursor on the
                // shared shift byte with the high nibble zeroed.
                body[shift_byte_pos] |= (shift as u8) << 4;
                pos += 1;
            }
            for &s in &self.unicam_buffer[..sub_block] {
                body[pos] = (s >> shift) as u8;
                pos += 1;
            }
            if even {
                body[pos] = shift as u8 & 0x0F;
                shift_byte_pos = pos;
            }
            block_index += 1;
        }

        // A trailing even sub-block's shift byte was written but the
        // cursor never moved past it.
        if block_index % 2 == 1 {
            pos + 1
        } else {
            pos
        }
    }

    fn code_pcm(&mut self, raw_audio: &[u32], body: &mut [u8]) -> usize {
        let mut pos = 0usize;
        for frame in raw_audio.chunks_exact(2) {
            let mono = self.agc.process(mono_sample(frame[0]));
            self.tap_sample(mono);
            body[pos] = (mono >> 24) as u8;
            body[pos + 1] = (mono >> 16) as u8;
            pos += 2;
        }
        pos
    }

    fn tap_sample(&mut self, sample: i32) {
        if let Some(tap) = &mut self.tap {
            let _ = tap.write_all(&sample.to_le_bytes());
        }
    }

    #[cfg(test)]
    fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }
}

/// Extract the left-channel mono sample from a Philips I2S word: the
/// 24-bit sample sits in bytes 1..3, and the arithmetic shift sign
/// extends it.
fn mono_sample(word: u32) -> i32 {
    (word as i32) >> 8
}

/// Shift needed to fit a sub-block whose peak magnitude is `max_abs`
/// into the coded sample width. The top bit of the word counts as used;
/// that keeps the shifted peak strictly inside the signed 8-bit range.
fn shift_for(max_abs: i32) -> u32 {
    let used_bits = if max_abs == 0 {
        1
    } else {
        33 - max_abs.leading_zeros() as i32
    };
    (used_bits - UNICAM_CODED_SAMPLE_SIZE_BITS as i32).max(0) as u32
}

/// UNICAM needs right shift of signed values to be arithmetic.
fn arithmetic_shift_supported() -> bool {
    let negative: i32 = -1;
    (negative >> 1) < 0
}
