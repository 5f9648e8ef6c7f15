//! URTP codec
//!
//! Gain-controlled mono downmix, FIR pre-emphasis, NICAM-like
//! adaptive-shift compression and datagram framing, backed by a bounded
//! ring of reusable datagram containers.

pub mod agc;
pub mod encoder;
pub mod fir;
pub mod ring;

pub use agc::GainController;
pub use encoder::UrtpEncoder;
pub use fir::Preemphasis;
pub use ring::{ContainerState, DatagramRing, RingHooks};
