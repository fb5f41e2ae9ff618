//! Streaming sample-rate conversion using rubato
//!
//! Converts deck audio from the source rate to the device rate in fixed-size
//! chunks. The ratio follows the device: when the output format changes the
//! deck rebuilds its resampler. When the rates already match the converter
//! degenerates to a pass-through queue.

use std::collections::VecDeque;

use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

use crate::audio::types::StereoFrame;
use crate::error::{Error, Result};

/// Source frames consumed per conversion call.
pub const RESAMPLE_CHUNK_FRAMES: usize = 1024;

struct Converter {
    resampler: FastFixedIn<f32>,
    /// Planar output scratch, sized to `output_frames_max`.
    output: [Vec<f32>; 2],
    /// Planar input scratch for the fixed-size chunk.
    input: [Vec<f32>; 2],
}

/// Streaming source-rate to device-rate converter for one deck chain.
pub struct StreamResampler {
    converter: Option<Converter>,
    queued: VecDeque<StereoFrame>,
    source_rate: u32,
    device_rate: u32,
}

impl StreamResampler {
    pub fn new(source_rate: u32, device_rate: u32) -> Result<Self> {
        let mut this = Self {
            converter: None,
            queued: VecDeque::new(),
            source_rate,
            device_rate,
        };
        this.rebuild()?;
        Ok(this)
    }

    /// Number of source frames to feed per `push_chunk` call.
    pub fn chunk_frames(&self) -> usize {
        RESAMPLE_CHUNK_FRAMES
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Re-prepare for a new device rate; flushes conversion state.
    pub fn set_device_rate(&mut self, device_rate: u32) -> Result<()> {
        if device_rate == self.device_rate {
            return Ok(());
        }
        self.device_rate = device_rate;
        self.rebuild()
    }

    /// Drop queued output and internal filter state (used after seeks).
    pub fn flush(&mut self) {
        self.queued.clear();
        if let Some(converter) = &mut self.converter {
            converter.resampler.reset();
        }
    }

    /// Pop one converted frame, if available.
    pub fn pop(&mut self) -> Option<StereoFrame> {
        self.queued.pop_front()
    }

    /// Feed exactly `chunk_frames()` source frames.
    pub fn push_chunk(&mut self, chunk: &[StereoFrame]) -> Result<()> {
        match &mut self.converter {
            None => {
                // Pass-through: rates match.
                self.queued.extend(chunk.iter().copied());
                Ok(())
            }
            Some(converter) => {
                for (i, frame) in chunk.iter().enumerate() {
                    converter.input[0][i] = frame.left;
                    converter.input[1][i] = frame.right;
                }
                // A short trailing chunk is zero-padded by the caller.
                let (_, produced) = converter
                    .resampler
                    .process_into_buffer(&converter.input, &mut converter.output, None)
                    .map_err(|e| Error::Resample {
                        source_rate: self.source_rate,
                        target_rate: self.device_rate,
                        message: e.to_string(),
                    })?;

                for i in 0..produced {
                    self.queued
                        .push_back(StereoFrame::new(converter.output[0][i], converter.output[1][i]));
                }
                Ok(())
            }
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        self.queued.clear();

        if self.source_rate == self.device_rate {
            self.converter = None;
            debug!(rate = self.source_rate, "resampler in pass-through mode");
            return Ok(());
        }

        let ratio = self.device_rate as f64 / self.source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLE_CHUNK_FRAMES,
            2,
        )
        .map_err(|e| Error::Resample {
            source_rate: self.source_rate,
            target_rate: self.device_rate,
            message: e.to_string(),
        })?;

        let max_out = resampler.output_frames_max();
        debug!(
            source = self.source_rate,
            device = self.device_rate,
            ratio,
            "built streaming resampler"
        );

        self.converter = Some(Converter {
            resampler,
            output: [vec![0.0; max_out], vec![0.0; max_out]],
            input: [
                vec![0.0; RESAMPLE_CHUNK_FRAMES],
                vec![0.0; RESAMPLE_CHUNK_FRAMES],
            ],
        });
        Ok(())
    }
}
