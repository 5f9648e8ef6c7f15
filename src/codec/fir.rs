//! Pre-emphasis FIR filter
//!
//! 13-tap filter applied to the mono stream before UNICAM coding.
//! Designed for 16 kHz sampling with the response:
//!
//! * 0 Hz - 150 Hz: -20 dB or better
//! * 1 kHz - 2 kHz: about -6 dB
//! * 3 kHz - 5 kHz: about -5 dB
//! * 6 kHz - 8 kHz: 0 dB
//!
//! The coefficients are kept as a table so the response can be checked
//! against the band gains above and regenerated if they ever change.

pub const FIR_TAP_COUNT: usize = 13;

const COEFFICIENTS: [f64; FIR_TAP_COUNT] = [
    -0.040326354,
    -0.018710450,
    -0.030575939,
    -0.049549371,
    -0.077800869,
    -0.167652402,
    0.769230769,
    -0.167652402,
    -0.077800869,
    -0.049549371,
    -0.030575939,
    -0.018710450,
    -0.040326354,
];

/// Per-encoder filter state: a circular history of the last
/// `FIR_TAP_COUNT` inputs.
#[derive(Debug, Clone)]
pub struct Preemphasis {
    history: [f64; FIR_TAP_COUNT],
    last_index: usize,
}

impl Preemphasis {
    pub fn new() -> Self {
        Self {
            history: [0.0; FIR_TAP_COUNT],
            last_index: 0,
        }
    }

    /// Push one input sample into the history.
    pub fn put(&mut self, input: f64) {
        self.history[self.last_index] = input;
        self.last_index += 1;
        if self.last_index == FIR_TAP_COUNT {
            self.last_index = 0;
        }
    }

    /// Dot product of the history and the coefficient table; the most
    /// recent input lines up with the first coefficient.
    pub fn get(&self) -> f64 {
        let mut acc = 0.0;
        let mut index = self.last_index;
        for coefficient in COEFFICIENTS {
            index = if index == 0 {
                FIR_TAP_COUNT - 1
            } else {
                index - 1
            };
            acc += self.history[index] * coefficient;
        }
        acc
    }
}

impl Default for Preemphasis {
    fn default() -> Self {
        Self::new()
    }
}
