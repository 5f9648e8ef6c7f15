//! Audio capture subsystem

pub mod capture;
pub mod device;

pub use capture::{CaptureSource, CpalCapture};
pub use device::{find_input_device, list_input_devices};
