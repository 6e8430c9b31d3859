//! Input device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::CaptureError;

/// Summary of a microphone the host exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available input devices
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.input_devices() else {
        return Vec::new();
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let (sample_rates, channels) = input_capabilities(&device);
            Some(InputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            })
        })
        .collect()
}

fn input_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            // Common sample rates
            for rate in [8000u32, 16000, 22050, 44100, 48000, 96000] {
                let sample_rate = cpal::SampleRate(rate);
                if sample_rate >= config.min_sample_rate()
                    && sample_rate <= config.max_sample_rate()
                    && !rates.contains(&rate)
                {
                    rates.push(rate);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// The named input device, or the host default when `name` is `None`.
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_input_device()
            .ok_or_else(|| CaptureError::Unavailable("no default input device".to_string()));
    };

    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(CaptureError::Unavailable(format!("input device '{}' not found", name)))
}
