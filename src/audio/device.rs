//! Capture device lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Find an input device by name. The name "default" selects the system
/// default input.
pub fn find_input_device(name: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    if name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default input device".to_string()));
    }

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Names of all input devices, default first.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut names = Vec::new();
    if let Some(name) = &default_name {
        names.push(name.clone());
    }
    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                if Some(&name) != default_name.as_ref() {
                    names.push(name);
                }
            }
        }
    }
    names
}
