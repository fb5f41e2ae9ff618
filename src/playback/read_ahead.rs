//! Read-ahead buffering in front of the decoder
//!
//! A lock-free SPSC ring sits between the decoder (filled by the read-ahead
//! worker pool) and the deck's render path (drained by the audio thread).
//! Audio-side reads never block: a shortfall yields zeros, and once the
//! decoder is exhausted the reader synthesizes silence past the end so the
//! deck's end-of-content detection can fire.
//!
//! Seeks use an epoch/acknowledge pair: the control side bumps the epoch and
//! stores the target frame; the fill task repositions the decoder and
//! acknowledges; until then the reader drains stale frames and stays silent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use tracing::{trace, warn};

use crate::audio::decoder::TrackDecoder;
use crate::audio::types::StereoFrame;

/// Frames decoded per fill step; seek requests are honored between steps.
const FILL_CHUNK_FRAMES: usize = 4096;

/// Cap on frames filled per service pass so pool workers rotate decks.
const FILL_PASS_LIMIT: usize = 32 * 1024;

struct SharedState {
    /// Seek generation requested by the reader.
    epoch: AtomicU64,
    /// Seek generation the fill task has caught up to.
    ack_epoch: AtomicU64,
    /// Target frame of the pending seek.
    seek_target: AtomicU64,
    /// Next source frame the reader will surface.
    read_pos: AtomicU64,
    /// Decoder exhausted (or failed terminally).
    eof_decoded: AtomicBool,
    /// Reader dropped; the task should stop doing work.
    detached: AtomicBool,
}

/// Producer side, serviced by the read-ahead worker pool.
pub(crate) struct FillTask {
    shared: Arc<SharedState>,
    inner: Mutex<FillInner>,
}

struct FillInner {
    decoder: TrackDecoder,
    producer: HeapProd<StereoFrame>,
    scratch: Vec<StereoFrame>,
}

impl FillTask {
    /// Whether this task still has a live reader.
    pub fn is_attached(&self) -> bool {
        !self.shared.detached.load(Ordering::Acquire)
    }

    /// Fill the ring from the decoder. Returns true when progress was made.
    ///
    /// Non-blocking with respect to other workers: a task already being
    /// serviced is skipped.
    pub fn service(&self) -> bool {
        if !self.is_attached() {
            return false;
        }

        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        let mut progressed = false;

        // Honor a pending seek before filling.
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if self.shared.ack_epoch.load(Ordering::SeqCst) != epoch {
            let target = self.shared.seek_target.load(Ordering::SeqCst);
            if let Err(e) = inner.decoder.seek(target) {
                warn!("read-ahead seek failed: {e}");
                self.shared.eof_decoded.store(true, Ordering::Release);
            } else {
                self.shared.eof_decoded.store(false, Ordering::Release);
            }
            self.shared.ack_epoch.store(epoch, Ordering::SeqCst);
            progressed = true;
        }

        if self.shared.eof_decoded.load(Ordering::Acquire) {
            return progressed;
        }

        let mut filled_this_pass = 0usize;
        let FillInner {
            decoder,
            producer,
            scratch,
        } = &mut *inner;

        loop {
            let vacant = producer.vacant_len();
            if vacant == 0 || filled_this_pass >= FILL_PASS_LIMIT {
                break;
            }

            let want = vacant.min(FILL_CHUNK_FRAMES);
            let got = match decoder.read(&mut scratch[..want]) {
                Ok(got) => got,
                Err(e) => {
                    warn!("read-ahead decode error: {e}");
                    self.shared.eof_decoded.store(true, Ordering::Release);
                    break;
                }
            };

            if got == 0 {
                trace!("read-ahead reached end of stream");
                self.shared.eof_decoded.store(true, Ordering::Release);
                break;
            }

            for frame in &scratch[..got] {
                // Vacancy was checked above; a full ring just drops the rest.
                if producer.try_push(*frame).is_err() {
                    break;
                }
            }
            filled_this_pass += got;
            progressed = true;

            // Yield to a newly requested seek between chunks.
            if self.shared.epoch.load(Ordering::SeqCst)
                != self.shared.ack_epoch.load(Ordering::SeqCst)
            {
                break;
            }
        }

        progressed
    }
}

/// Consumer side, owned by the deck chain and drained on the audio thread.
pub(crate) struct ReadAheadReader {
    shared: Arc<SharedState>,
    consumer: HeapCons<StereoFrame>,
    task: Arc<FillTask>,
    underruns: u64,
}

impl ReadAheadReader {
    /// Build the ring over an opened decoder, positioned at `start_frame`.
    ///
    /// Capacity is two seconds of source audio. The returned task must be
    /// registered with the worker pool; the reader keeps it alive.
    pub fn new(decoder: TrackDecoder, start_frame: u64) -> (Arc<FillTask>, ReadAheadReader) {
        let capacity = (decoder.sample_rate() as usize) * 2;
        let ring = HeapRb::<StereoFrame>::new(capacity.max(FILL_CHUNK_FRAMES));
        let (producer, consumer) = ring.split();

        let shared = Arc::new(SharedState {
            epoch: AtomicU64::new(1),
            ack_epoch: AtomicU64::new(0),
            seek_target: AtomicU64::new(start_frame),
            read_pos: AtomicU64::new(start_frame),
            eof_decoded: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });

        let task = Arc::new(FillTask {
            shared: Arc::clone(&shared),
            inner: Mutex::new(FillInner {
                decoder,
                producer,
                scratch: vec![StereoFrame::ZERO; FILL_CHUNK_FRAMES],
            }),
        });

        let reader = ReadAheadReader {
            shared,
            consumer,
            task: Arc::clone(&task),
            underruns: 0,
        };

        (task, reader)
    }

    /// Handle to the fill task for pool registration.
    pub fn task(&self) -> &Arc<FillTask> {
        &self.task
    }

    /// Next source frame this reader will surface.
    pub fn position(&self) -> u64 {
        self.shared.read_pos.load(Ordering::Acquire)
    }

    /// Decoder exhausted and every buffered frame drained.
    pub fn exhausted(&self) -> bool {
        self.caught_up()
            && self.shared.eof_decoded.load(Ordering::Acquire)
            && self.consumer.is_empty()
    }

    fn caught_up(&self) -> bool {
        self.shared.ack_epoch.load(Ordering::SeqCst) == self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Request a reposition. Takes effect at the fill task's next pass; reads
    /// in between yield silence.
    pub fn seek(&mut self, frame: u64) {
        self.shared.seek_target.store(frame, Ordering::SeqCst);
        self.shared.read_pos.store(frame, Ordering::SeqCst);
        self.shared.eof_decoded.store(false, Ordering::Release);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        while self.consumer.try_pop().is_some() {}
    }

    /// Non-blocking read. Fills `out` completely, zero-padding any shortfall,
    /// and returns the number of frames that carried content.
    ///
    /// The read position advances by the content count, and past end of
    /// stream by the full block so downstream end detection can fire; a
    /// plain underrun does not advance it.
    pub fn read(&mut self, out: &mut [StereoFrame]) -> usize {
        if !self.caught_up() {
            // Seek in flight: drain stale frames, stay silent.
            while self.consumer.try_pop().is_some() {}
            out.fill(StereoFrame::ZERO);
            return 0;
        }

        let mut got = 0;
        while got < out.len() {
            match self.consumer.try_pop() {
                Some(frame) => {
                    out[got] = frame;
                    got += 1;
                }
                None => break,
            }
        }

        if got < out.len() {
            out[got..].fill(StereoFrame::ZERO);

            if self.shared.eof_decoded.load(Ordering::Acquire) {
                // Synthesize silence past the end of the stream.
                self.shared
                    .read_pos
                    .fetch_add(out.len() as u64, Ordering::AcqRel);
            } else {
                self.underruns += 1;
                if self.underruns % 1000 == 1 {
                    warn!(total = self.underruns, "read-ahead underrun");
                }
                self.shared.read_pos.fetch_add(got as u64, Ordering::AcqRel);
            }
        } else {
            self.shared.read_pos.fetch_add(got as u64, Ordering::AcqRel);
        }

        got
    }
}

impl Drop for ReadAheadReader {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::Release);
    }
}
