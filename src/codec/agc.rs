//! Automatic gain control
//!
//! Conditions each mono sample with a rolling adaptive left shift that
//! keeps the amplitude headroom near a target number of unused bits.
//! Increases in gain are smoothed over many blocks; decreases happen
//! immediately to avoid clipping.

use tracing::debug;

use crate::config::StreamConfig;

/// Rolling gain state. One instance per encoder.
#[derive(Debug, Clone)]
pub struct GainController {
    /// Current left shift applied to each sample.
    shift: i32,
    max_shift: i32,
    desired_unused_bits: i32,
    hysteresis_bits: i32,
    up_shifts_for_a_shift: u32,
    /// Samples with absolute value at or below this are passed through.
    threshold: i32,
    samples_per_block: u32,
    sample_count: u32,
    /// Minimum number of unused bits seen in the current block.
    unused_bits_min: i32,
    /// Consecutive blocks that suggested a gain increase.
    up_shift_count: u32,
}

impl GainController {
    pub fn new(config: &StreamConfig) -> Self {
        let max_shift = config.audio_max_shift_bits as i32;
        let default_shift = (max_shift - config.shift_hysteresis_bits).clamp(0, max_shift);
        Self {
            shift: default_shift,
            max_shift,
            desired_unused_bits: config.desired_unused_bits,
            hysteresis_bits: config.shift_hysteresis_bits,
            up_shifts_for_a_shift: config.up_shifts_for_a_shift,
            threshold: config.audio_shift_threshold,
            samples_per_block: config.samples_per_block() as u32,
            sample_count: 0,
            unused_bits_min: i32::MAX,
            up_shift_count: 0,
        }
    }

    /// Condition one mono sample. Block-boundary gain adjustment happens
    /// inside once `samples_per_block` samples have passed through.
    pub fn process(&mut self, mono: i32) -> i32 {
        let abs = mono.unsigned_abs();
        // Leading unused bits of a 32-bit signed value, never counting
        // the sign bit itself.
        let unused_bits = (abs.leading_zeros() as i32 - 1).max(0);

        let out = if (abs as i64) > (self.threshold as i64) {
            shift_up_saturating(mono, self.shift)
        } else {
            mono
        };

        if unused_bits < self.unused_bits_min {
            self.unused_bits_min = unused_bits;
        }
        self.sample_count += 1;
        if self.sample_count >= self.samples_per_block {
            self.sample_count = 0;
            self.end_of_block();
        }

        out
    }

    /// Current shift in bits.
    pub fn shift(&self) -> i32 {
        self.shift
    }

    fn end_of_block(&mut self) {
        // Emergency clip avoidance first.
        if self.shift > self.unused_bits_min {
            self.shift = self.unused_bits_min;
        }
        if (self.unused_bits_min - self.shift > self.desired_unused_bits + self.hysteresis_bits)
            && (self.shift < self.max_shift)
        {
            // Note the suggestion; only a long run of them raises the gain.
            self.up_shift_count += 1;
            if self.up_shift_count > self.up_shifts_for_a_shift {
                self.shift += 1;
                self.up_shift_count = 0;
                debug!(shift = self.shift, "gain increased");
            }
        } else if (self.unused_bits_min - self.shift < self.desired_unused_bits) && (self.shift > 0)
        {
            // A reduction must happen immediately.
            self.shift -= 1;
            self.up_shift_count = 0;
            debug!(shift = self.shift, "gain reduced");
        }

        // Let the minimum "relax" so headroom can grow back.
        self.unused_bits_min = self.unused_bits_min.saturating_add(1);
    }
}

fn shift_up_saturating(sample: i32, shift: i32) -> i32 {
    let wide = (sample as i64) << shift;
    wide.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
