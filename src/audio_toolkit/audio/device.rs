use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use log::warn;

/// Names of the available input devices.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = crate::audio_toolkit::get_cpal_host();
    let devices = host
        .input_devices()
        .map_err(|e| anyhow!("Failed to enumerate input devices: {e}"))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Names of the available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = crate::audio_toolkit::get_cpal_host();
    let devices = host
        .output_devices()
        .map_err(|e| anyhow!("Failed to enumerate output devices: {e}"))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Find an input device by exact name, falling back to the default device.
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = crate::audio_toolkit::get_cpal_host();

    if let Some(name) = name {
        let found = host
            .input_devices()
            .map_err(|e| anyhow!("Failed to enumerate input devices: {e}"))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));
        match found {
            Some(device) => return Ok(device),
            None => warn!("Input device '{}' not found, using default device", name),
        }
    }

    host.default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))
}

/// Find an output device by exact name, falling back to the default device.
pub fn find_output_device(name: Option<&str>) -> Result<Option<cpal::Device>> {
    let host = crate::audio_toolkit::get_cpal_host();

    if let Some(name) = name {
        let found = host
            .output_devices()
            .map_err(|e| anyhow!("Failed to enumerate output devices: {e}"))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));
        match found {
            Some(device) => return Ok(Some(device)),
            None => warn!("Output device '{}' not found, using default device", name),
        }
    }

    Ok(None)
}
