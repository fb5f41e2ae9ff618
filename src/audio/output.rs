//! Audio device output using cpal
//!
//! Owns the output stream and invokes the engine render callback from the
//! device's realtime thread. Device enumeration is grouped per cpal host
//! ("device type"), mirroring how multi-backend platforms present audio
//! stacks. Stream errors raise a flag that the engine polls to trigger
//! fallback to the default device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audio::types::StereoFrame;
use crate::error::{Error, Result};

/// One backend ("device type") and its devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    /// Backend name, e.g. "ALSA", "CoreAudio", "WASAPI".
    #[serde(rename = "type")]
    pub type_name: String,
    /// Output device names offered by this backend.
    pub devices: Vec<String>,
    /// The backend's default output device, when it has one.
    pub default_device: Option<String>,
    /// True when this backend drives the engine's current stream.
    pub is_current: bool,
    /// The engine's current device, present only on the current backend.
    pub current_device: Option<String>,
}

/// Selects a backend and/or device for `set_device`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSelector {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub device: Option<String>,
}

/// Render callback invoked on the audio thread with a stereo block.
pub trait RenderFn: FnMut(&mut [StereoFrame]) + Send + 'static {}
impl<F: FnMut(&mut [StereoFrame]) + Send + 'static> RenderFn for F {}

/// An open output device session.
pub struct AudioOutput {
    host_name: String,
    device: Device,
    device_name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    error_flag: Arc<AtomicBool>,
}

impl AudioOutput {
    /// Open an output session on the selected backend/device, falling back
    /// to the default device when the selection cannot be honored.
    pub fn open(selector: &DeviceSelector) -> Result<Self> {
        let host = resolve_host(selector.type_name.as_deref())?;
        let host_name = host.id().name().to_string();

        let device = match selector.device.as_deref() {
            Some(wanted) => {
                let found = host
                    .output_devices()
                    .map_err(|e| Error::AudioDevice(format!("device enumeration failed: {e}")))?
                    .find(|d| d.name().ok().as_deref() == Some(wanted));
                match found {
                    Some(device) => device,
                    None => {
                        warn!("device '{wanted}' not found, falling back to default");
                        host.default_output_device().ok_or_else(|| {
                            Error::AudioDevice(format!(
                                "device '{wanted}' not found and no default device available"
                            ))
                        })?
                    }
                }
            }
            None => host
                .default_output_device()
                .ok_or_else(|| Error::AudioDevice("no default output device".to_string()))?,
        };

        let device_name = device
            .name()
            .unwrap_or_else(|_| "<unknown>".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| Error::AudioDevice(format!("no usable output config: {e}")))?;

        let sample_format = supported.sample_format();
        let config = supported.config();

        info!(
            host = %host_name,
            device = %device_name,
            rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "opened audio device"
        );

        Ok(Self {
            host_name,
            device,
            device_name,
            config,
            sample_format,
            stream: None,
            error_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the output stream; `render` fills stereo blocks on the audio
    /// thread and must never block.
    pub fn start<F: RenderFn>(&mut self, render: F) -> Result<()> {
        let channels = self.config.channels as usize;
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream_f32(render, channels)?,
            SampleFormat::I16 => self.build_stream_i16(render, channels)?,
            SampleFormat::U16 => self.build_stream_u16(render, channels)?,
            other => {
                return Err(Error::AudioDevice(format!(
                    "unsupported sample format: {other:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioDevice(format!("failed to start stream: {e}")))?;
        self.stream = Some(stream);
        debug!("audio stream started");
        Ok(())
    }

    fn build_stream_f32<F: RenderFn>(&self, mut render: F, channels: usize) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        let mut scratch: Vec<StereoFrame> = Vec::new();
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if scratch.len() < frames {
                        scratch.resize(frames, StereoFrame::ZERO);
                    }
                    render(&mut scratch[..frames]);
                    for (i, out) in data.chunks_mut(channels).enumerate() {
                        write_frame_f32(out, scratch[i]);
                    }
                },
                move |err| {
                    error!("audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioDevice(format!("failed to build stream: {e}")))
    }

    fn build_stream_i16<F: RenderFn>(&self, mut render: F, channels: usize) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        let mut scratch: Vec<StereoFrame> = Vec::new();
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if scratch.len() < frames {
                        scratch.resize(frames, StereoFrame::ZERO);
                    }
                    render(&mut scratch[..frames]);
                    for (i, out) in data.chunks_mut(channels).enumerate() {
                        let frame = scratch[i].clamped();
                        out[0] = (frame.left * i16::MAX as f32) as i16;
                        if out.len() > 1 {
                            out[1] = (frame.right * i16::MAX as f32) as i16;
                        }
                    }
                },
                move |err| {
                    error!("audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioDevice(format!("failed to build stream: {e}")))
    }

    fn build_stream_u16<F: RenderFn>(&self, mut render: F, channels: usize) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        let mut scratch: Vec<StereoFrame> = Vec::new();
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if scratch.len() < frames {
                        scratch.resize(frames, StereoFrame::ZERO);
                    }
                    render(&mut scratch[..frames]);
                    for (i, out) in data.chunks_mut(channels).enumerate() {
                        let frame = scratch[i].clamped();
                        out[0] = ((frame.left + 1.0) * 32767.5) as u16;
                        if out.len() > 1 {
                            out[1] = ((frame.right + 1.0) * 32767.5) as u16;
                        }
                    }
                },
                move |err| {
                    error!("audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioDevice(format!("failed to build stream: {e}")))
    }

    /// Pause and drop the stream.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("failed to pause stream: {e}");
            }
            drop(stream);
            debug!("audio stream stopped");
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// True when the stream error callback fired since the last clear.
    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    pub fn clear_error(&self) {
        self.error_flag.store(false, Ordering::SeqCst);
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_frame_f32(out: &mut [f32], frame: StereoFrame) {
    let frame = frame.clamped();
    match out.len() {
        0 => {}
        1 => out[0] = (frame.left + frame.right) * 0.5,
        _ => {
            out[0] = frame.left;
            out[1] = frame.right;
            for sample in &mut out[2..] {
                *sample = 0.0;
            }
        }
    }
}

fn resolve_host(type_name: Option<&str>) -> Result<Host> {
    match type_name {
        None => Ok(cpal::default_host()),
        Some(wanted) => {
            let id = cpal::available_hosts()
                .into_iter()
                .find(|id| id.name() == wanted)
                .ok_or_else(|| Error::AudioDevice(format!("unknown device type '{wanted}'")))?;
            cpal::host_from_id(id)
                .map_err(|e| Error::AudioDevice(format!("host '{wanted}' unavailable: {e}")))
        }
    }
}

/// Enumerate all backends and their output devices.
///
/// `current` identifies the engine's active (host, device) pair so the
/// listing can flag it.
pub fn list_devices(current: Option<(&str, &str)>) -> Vec<DeviceTypeInfo> {
    let mut result = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                warn!("host {} unavailable: {e}", host_id.name());
                continue;
            }
        };

        let devices: Vec<String> = host
            .output_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();

        let default_device = host.default_output_device().and_then(|d| d.name().ok());
        let is_current = current.map(|(h, _)| h == host_id.name()).unwrap_or(false);
        let current_device = if is_current {
            current.map(|(_, d)| d.to_string())
        } else {
            None
        };

        result.push(DeviceTypeInfo {
            type_name: host_id.name().to_string(),
            devices,
            default_device,
            is_current,
            current_device,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_devices_does_not_panic() {
        // Works headless: hosts may report zero devices.
        let listing = list_devices(None);
        for info in &listing {
            assert!(!info.is_current);
            assert!(info.current_device.is_none());
        }
    }

    #[test]
    fn frame_write_downmixes_mono() {
        let mut out = [0.0f32];
        write_frame_f32(&mut out, StereoFrame::new(0.4, 0.2));
        assert!((out[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn frame_write_zeroes_extra_channels() {
        let mut out = [1.0f32; 4];
        write_frame_f32(&mut out, StereoFrame::new(0.5, -0.5));
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], -0.5);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
    }

    /// Requires audio hardware.
    #[test]
    #[ignore] // Run with: cargo test output -- --ignored
    fn open_default_device() {
        let output = AudioOutput::open(&DeviceSelector::default());
        assert!(output.is_ok());
    }
}
