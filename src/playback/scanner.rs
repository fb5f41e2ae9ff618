//! Audible-region scanner
//!
//! Finds where a track's audible content actually starts and ends so that
//! transitions can skip leading silence and begin fading where the music
//! dies away rather than at the file boundary.
//!
//! Three searches run over the channel-normalized envelope:
//! - first audible frame: level above -60 dBFS sustained for 1 ms, searched
//!   in the first half of the file;
//! - last audible frame: level below -45 dBFS sustained for 1.25 s, searched
//!   from max(first audible, midpoint, 30 s before the end);
//! - end of content: level below -60 dBFS sustained for 4 ms after the last
//!   audible frame.
//!
//! A search that finds nothing leaves the corresponding bound at the file
//! edge, so a track with no detectable silence plays in full.

use tracing::debug;

use crate::audio::decoder::TrackDecoder;
use crate::audio::types::{db_to_gain, StereoFrame};
use crate::error::Result;

/// Level below which a frame counts as silent (-60 dBFS).
fn silence_threshold() -> f32 {
    db_to_gain(-60.0)
}

/// Level below which trailing content counts as ending (-45 dBFS).
fn ending_threshold() -> f32 {
    db_to_gain(-45.0)
}

const FIRST_SOUND_WINDOW_SECS: f64 = 1e-3;
const LAST_SOUND_WINDOW_SECS: f64 = 1.25;
const LAST_SOUND_SCAN_SECS: f64 = 30.0;
const END_WINDOW_SECS: f64 = 0.004;

const SCAN_CHUNK_FRAMES: usize = 8192;

/// Audible bounds of one track, immutable once published to a deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudibleRegion {
    /// First frame whose level exceeds -60 dBFS (0 when none found).
    pub first_audible: u64,
    /// Frame at which the level drops below -45 dBFS for good.
    pub last_audible: u64,
    /// Logical end of content: below -60 dBFS after `last_audible`.
    pub end_frame: u64,
    /// Total frames in the file.
    pub total_frames: u64,
}

impl AudibleRegion {
    /// Full-file fallback used when scanning is impossible.
    pub fn full(total_frames: u64) -> Self {
        Self {
            first_audible: 0,
            last_audible: total_frames,
            end_frame: total_frames,
            total_frames,
        }
    }

    /// Provisional region known right after load: only the leading bound.
    pub fn provisional(first_audible: u64, total_frames: u64) -> Self {
        Self {
            first_audible,
            last_audible: total_frames,
            end_frame: total_frames,
            total_frames,
        }
    }
}

/// Find the first audible frame in the first half of the file.
///
/// The decoder is left positioned wherever the search stopped; callers
/// reposition it afterwards.
pub fn quick_first_audible(decoder: &mut TrackDecoder) -> Result<u64> {
    let total = decoder.total_frames();
    let rate = decoder.sample_rate();
    let mid = total / 2;
    let window = window_frames(rate, FIRST_SOUND_WINDOW_SECS);

    decoder.seek(0)?;
    let found = search_level(decoder, 0, mid, window, |m| m >= silence_threshold())?;
    Ok(found.unwrap_or(0))
}

/// Run the trailing-silence searches and assemble the full region.
///
/// `first_audible` comes from the quick search done at load time. Intended
/// to run on an independent reader while the deck is already playing.
pub fn scan_track(decoder: &mut TrackDecoder, first_audible: u64) -> Result<AudibleRegion> {
    let total = decoder.total_frames();
    let rate = decoder.sample_rate();

    let mut region = AudibleRegion::provisional(first_audible, total);

    let scan_start = first_audible
        .max(total / 2)
        .max(total.saturating_sub(seconds_to_frames(rate, LAST_SOUND_SCAN_SECS)));

    decoder.seek(scan_start)?;
    let last_window = window_frames(rate, LAST_SOUND_WINDOW_SECS);
    let silence_start = search_level(decoder, scan_start, total, last_window, |m| {
        m < ending_threshold()
    })?;

    if let Some(last_audible) = silence_start {
        if last_audible > first_audible {
            region.last_audible = last_audible;

            decoder.seek(last_audible)?;
            let end_window = window_frames(rate, END_WINDOW_SECS);
            let end = search_level(decoder, last_audible, total, end_window, |m| {
                m < silence_threshold()
            })?;

            if let Some(end_frame) = end {
                if end_frame > last_audible {
                    region.end_frame = end_frame.min(total);
                }
            }
        }
    }

    debug!(
        first = region.first_audible,
        last = region.last_audible,
        end = region.end_frame,
        total = region.total_frames,
        "audible region scanned"
    );

    Ok(region)
}

/// Find the first position in `[start, end)` where `predicate` holds on the
/// frame envelope for `window` consecutive frames. Returns the start of the
/// run. The run must complete before `end`; a shorter run at the boundary
/// does not count.
fn search_level<P: Fn(f32) -> bool>(
    decoder: &mut TrackDecoder,
    start: u64,
    end: u64,
    window: u64,
    predicate: P,
) -> Result<Option<u64>> {
    if start >= end || window == 0 {
        return Ok(None);
    }

    let mut buf = vec![StereoFrame::ZERO; SCAN_CHUNK_FRAMES];
    let mut pos = start;
    let mut run_start = 0u64;
    let mut run_len = 0u64;

    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        let got = decoder.read(&mut buf[..want])?;
        if got == 0 {
            break;
        }

        for (i, frame) in buf[..got].iter().enumerate() {
            if predicate(frame.magnitude()) {
                if run_len == 0 {
                    run_start = pos + i as u64;
                }
                run_len += 1;
                if run_len >= window {
                    return Ok(Some(run_start));
                }
            } else {
                run_len = 0;
            }
        }

        pos += got as u64;
    }

    Ok(None)
}

fn window_frames(rate: u32, seconds: f64) -> u64 {
    ((rate as f64 * seconds).round() as u64).max(1)
}

fn seconds_to_frames(rate: u32, seconds: f64) -> u64 {
    (rate as f64 * seconds) as u64
}
