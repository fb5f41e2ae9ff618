//! Track and queue contracts
//!
//! The engine never owns track metadata or the queue data structure; callers
//! hand it opaque track handles through a queue. A track handle only has to
//! open a byte stream the decoder can probe, and may report a pre-gain.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use symphonia::core::io::MediaSource;

/// An opaque track handle supplied by the external queue.
///
/// The engine reads exactly two things from it: a way to open the underlying
/// media (possibly more than once, for the scanning reader), and an optional
/// pre-gain in decibels applied on top of the deck volume.
pub trait Track: Send + Sync {
    /// Open a fresh byte stream over the track's media.
    ///
    /// Called once per reader; the scanner opens a second, independent stream
    /// while the playback reader is active.
    fn open(&self) -> io::Result<Box<dyn MediaSource>>;

    /// Optional pre-gain in decibels.
    fn pre_gain_db(&self) -> Option<f32> {
        None
    }

    /// File extension hint for format probing, if known.
    fn extension_hint(&self) -> Option<String> {
        None
    }

    /// Human-readable name used in log lines only.
    fn display_name(&self) -> String {
        "<track>".to_string()
    }
}

/// The queue contract consumed by the engine.
///
/// The engine pulls from the head and never retains a handle after the track
/// unloads.
pub trait TrackQueue: Send {
    /// Number of tracks remaining.
    fn len(&self) -> usize;

    /// Pop the next track, or None when the queue is exhausted.
    fn fetch_next(&mut self) -> Option<Arc<dyn Track>>;

    /// True when no tracks remain.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed track handle.
#[derive(Debug, Clone)]
pub struct FileTrack {
    path: PathBuf,
    pre_gain_db: Option<f32>,
}

impl FileTrack {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pre_gain_db: None,
        }
    }

    pub fn with_pre_gain_db(mut self, db: f32) -> Self {
        self.pre_gain_db = Some(db);
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Track for FileTrack {
    fn open(&self) -> io::Result<Box<dyn MediaSource>> {
        let file = std::fs::File::open(&self.path)?;
        Ok(Box::new(file))
    }

    fn pre_gain_db(&self) -> Option<f32> {
        self.pre_gain_db
    }

    fn extension_hint(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_string())
    }

    fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Simple Vec-backed queue for tests and demos.
#[derive(Default)]
pub struct MemoryQueue {
    tracks: Vec<Arc<dyn Track>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self { tracks: Vec::new() }
    }

    pub fn push(&mut self, track: Arc<dyn Track>) {
        self.tracks.push(track);
    }

    pub fn push_file(&mut self, path: impl Into<PathBuf>) {
        self.tracks.push(Arc::new(FileTrack::new(path)));
    }
}

impl TrackQueue for MemoryQueue {
    fn len(&self) -> usize {
        self.tracks.len()
    }

    fn fetch_next(&mut self) -> Option<Arc<dyn Track>> {
        if self.tracks.is_empty() {
            None
        } else {
            Some(self.tracks.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedTrack(&'static str);

    impl Track for NamedTrack {
        fn open(&self) -> io::Result<Box<dyn MediaSource>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "test track"))
        }

        fn display_name(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn memory_queue_pops_in_order() {
        let mut queue = MemoryQueue::new();
        queue.push(Arc::new(NamedTrack("a")));
        queue.push(Arc::new(NamedTrack("b")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.fetch_next().unwrap().display_name(), "a");
        assert_eq!(queue.fetch_next().unwrap().display_name(), "b");
        assert!(queue.fetch_next().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn file_track_reports_pre_gain() {
        let track = FileTrack::new("/tmp/x.wav").with_pre_gain_db(-3.0);
        assert_eq!(track.pre_gain_db(), Some(-3.0));
    }
}
