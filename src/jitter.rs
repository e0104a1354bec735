//! Per-sender jitter buffer (C2): a bounded ordered map from sequence
//! number to frame, drained in ascending sequence order.
use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::audio::AudioFrame;

struct Inner {
    window: usize,
    expected_seq: u32,
    frames: BTreeMap<u32, AudioFrame>,
}

/// Thread-safe bounded reorder window for one sender's UDP stream.
///
/// Each of `insert`/`pop_expected`/`pop_oldest` takes the lock for just that
/// one call; the receive pipeline's insert-then-pop-pass per tick (spec.md
/// §4.2) is therefore two short critical sections back to back, not one held
/// across both, which is fine here since only the owning receive thread ever
/// drains a given sender's buffer.
pub struct JitterBuffer {
    inner: Mutex<Inner>,
}

impl JitterBuffer {
    /// `window` is the reorder bound: 10 for private calls, 5 for group.
    pub fn new(window: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window,
                expected_seq: 0,
                frames: BTreeMap::new(),
            }),
        }
    }

    /// Insert a frame at `seq`. If the map exceeds `W` entries afterward,
    /// the smallest key is evicted.
    pub fn insert(&self, seq: u32, frame: AudioFrame) {
        let mut inner = self.inner.lock();
        inner.frames.insert(seq, frame);
        if inner.frames.len() > inner.window {
            if let Some(&smallest) = inner.frames.keys().next() {
                inner.frames.remove(&smallest);
            }
        }
    }

    /// Remove and return the frame at `expected_seq`, advancing the cursor
    /// to `expected_seq + 1`. Returns `None` if not yet present.
    pub fn pop_expected(&self) -> Option<AudioFrame> {
        let mut inner = self.inner.lock();
        let expected = inner.expected_seq;
        let frame = inner.frames.remove(&expected);
        if frame.is_some() {
            inner.expected_seq = expected.wrapping_add(1);
        }
        frame
    }

    /// Remove and return the smallest-sequence frame, advancing
    /// `expected_seq` to one past it (group-call fallback / lossy catch-up).
    pub fn pop_oldest(&self) -> Option<AudioFrame> {
        let mut inner = self.inner.lock();
        let smallest = *inner.frames.keys().next()?;
        let frame = inner.frames.remove(&smallest);
        inner.expected_seq = smallest.wrapping_add(1);
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn expected_seq(&self) -> u32 {
        self.inner.lock().expected_seq
    }
}
