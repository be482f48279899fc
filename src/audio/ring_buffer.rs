use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use thiserror::Error;

/// Errors from the time-addressed ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// The requested range is entirely outside the buffered bounds, or a
    /// single store was larger than the buffer itself.
    #[error("requested sample range is outside the buffered time bounds")]
    TooMuch,
    /// Reading the time bounds raced with too many concurrent updates. The
    /// reader was likely preempted for a long time; treat as transient.
    #[error("could not get a consistent snapshot of the buffer's time bounds")]
    CpuOverload,
}

/// One published snapshot of the valid sample-time range.
struct TimeBounds {
    start: AtomicI64,
    end: AtomicI64,
    // Odd while the writer is mid-update, even when consistent.
    update_counter: AtomicU32,
}

const TIME_BOUNDS_QUEUE_SIZE: usize = 32;
const TIME_BOUNDS_QUEUE_MASK: u32 = TIME_BOUNDS_QUEUE_SIZE as u32 - 1;
const FETCH_BOUNDS_RETRIES: usize = 8;

/// A ring buffer of interleaved `f32` frames addressed by sample time rather
/// than by read/write cursors.
///
/// The writer stamps each store with the sample time of its first frame; the
/// reader asks for an arbitrary time range and gets silence for any part of it
/// that is no longer (or not yet) buffered. The valid range is published
/// through a small FIFO of versioned snapshots so the reader never takes a
/// lock.
///
/// Concurrency contract: at most one thread stores and at most one thread
/// fetches at a time. The playthrough engine enforces this with its two buffer
/// mutexes; `time_bounds` may be called from either side.
pub struct RingBuffer {
    data: UnsafeCell<Box<[f32]>>,
    channels: usize,
    capacity_frames: usize,
    frame_mask: usize,
    bounds_queue: [TimeBounds; TIME_BOUNDS_QUEUE_SIZE],
    bounds_queue_ptr: AtomicU32,
}

// The data cell is only touched by the single writer (store) and single
// reader (fetch), each serialized externally. Bounds are atomics.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocates a buffer holding at least `capacity_frames` frames of
    /// `channels` interleaved samples. Capacity is rounded up to a power of
    /// two.
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let capacity_frames = capacity_frames.max(2).next_power_of_two();
        let data = vec![0.0f32; capacity_frames * channels].into_boxed_slice();

        let bounds_queue = std::array::from_fn(|_| TimeBounds {
            start: AtomicI64::new(0),
            end: AtomicI64::new(0),
            update_counter: AtomicU32::new(0),
        });

        Self {
            data: UnsafeCell::new(data),
            channels,
            capacity_frames,
            frame_mask: capacity_frames - 1,
            bounds_queue,
            bounds_queue_ptr: AtomicU32::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// The sample-time range currently held, as `(start, end)`. `end` is
    /// one past the last valid frame.
    pub fn time_bounds(&self) -> Result<(i64, i64), RingBufferError> {
        for _ in 0..FETCH_BOUNDS_RETRIES {
            let ptr = self.bounds_queue_ptr.load(Ordering::Acquire);
            let bounds = &self.bounds_queue[(ptr & TIME_BOUNDS_QUEUE_MASK) as usize];

            let counter_before = bounds.update_counter.load(Ordering::Acquire);
            let start = bounds.start.load(Ordering::Acquire);
            let end = bounds.end.load(Ordering::Acquire);
            let counter_after = bounds.update_counter.load(Ordering::Acquire);

            if counter_before == counter_after && counter_before & 1 == 0 {
                return Ok((start, end));
            }
        }
        Err(RingBufferError::CpuOverload)
    }

    fn set_time_bounds(&self, start: i64, end: i64) {
        let next = self.bounds_queue_ptr.load(Ordering::Relaxed).wrapping_add(1);
        let bounds = &self.bounds_queue[(next & TIME_BOUNDS_QUEUE_MASK) as usize];

        bounds.update_counter.fetch_add(1, Ordering::AcqRel);
        bounds.start.store(start, Ordering::Release);
        bounds.end.store(end, Ordering::Release);
        bounds.update_counter.fetch_add(1, Ordering::AcqRel);

        self.bounds_queue_ptr.store(next, Ordering::Release);
    }

    fn frame_offset(&self, sample_time: i64) -> usize {
        (sample_time as usize & self.frame_mask) * self.channels
    }

    /// Zeroes `frames` frames starting at the in-buffer position of
    /// `sample_time`, splitting across the wrap point if needed.
    fn zero_range(&self, sample_time: i64, frames: usize) {
        debug_assert!(frames <= self.capacity_frames);
        let data = unsafe { &mut *self.data.get() };
        let mut offset = self.frame_offset(sample_time);
        let mut remaining = frames * self.channels;
        while remaining > 0 {
            let run = remaining.min(data.len() - offset);
            data[offset..offset + run].fill(0.0);
            offset = 0;
            remaining -= run;
        }
    }

    /// Stores `frames` frames of interleaved samples beginning at
    /// `start_sample_time`.
    ///
    /// A store that goes backwards in time resets the buffer bounds to the
    /// new range. A store that leaves a gap after the previous end zero-fills
    /// the gap. The bounds start advances past anything the write overwrote.
    pub fn store(
        &self,
        samples: &[f32],
        frames: usize,
        start_sample_time: i64,
    ) -> Result<(), RingBufferError> {
        if frames == 0 {
            return Ok(());
        }
        if frames > self.capacity_frames {
            return Err(RingBufferError::TooMuch);
        }
        debug_assert!(samples.len() >= frames * self.channels);

        let end_time = start_sample_time + frames as i64;
        let (cur_start, cur_end) = self.time_bounds()?;

        let (cur_start, cur_end) = if start_sample_time < cur_end {
            // Going backwards: invalidate everything buffered so far.
            self.set_time_bounds(start_sample_time, start_sample_time);
            (start_sample_time, start_sample_time)
        } else if cur_start == cur_end {
            // First write into an empty buffer defines the bounds.
            (start_sample_time, start_sample_time)
        } else {
            (cur_start, cur_end)
        };

        if start_sample_time > cur_end {
            // Gap between the previous write and this one. Anything a reader
            // could fetch from the gap must be silence.
            let gap = (start_sample_time - cur_end).min(self.capacity_frames as i64) as usize;
            self.zero_range(end_time - gap as i64 - frames as i64, gap);
        }

        let data = unsafe { &mut *self.data.get() };
        let mut src = 0;
        let mut offset = self.frame_offset(start_sample_time);
        let mut remaining = frames * self.channels;
        while remaining > 0 {
            let run = remaining.min(data.len() - offset);
            data[offset..offset + run].copy_from_slice(&samples[src..src + run]);
            offset = 0;
            src += run;
            remaining -= run;
        }

        // The new end may have lapped the old start.
        let new_start = cur_start.max(end_time - self.capacity_frames as i64);
        self.set_time_bounds(new_start, end_time);

        Ok(())
    }

    fn clip_to_bounds(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Option<(i64, i64)>, RingBufferError> {
        let (bounds_start, bounds_end) = self.time_bounds()?;
        if end <= bounds_start || start >= bounds_end {
            return Ok(None);
        }
        Ok(Some((start.max(bounds_start), end.min(bounds_end))))
    }

    /// Fetches `frames` frames beginning at `start_sample_time` into `out`.
    ///
    /// Any part of the range outside the buffered bounds is zero-filled;
    /// `TooMuch` means none of the range overlapped the bounds.
    pub fn fetch(
        &self,
        out: &mut [f32],
        frames: usize,
        start_sample_time: i64,
    ) -> Result<(), RingBufferError> {
        if frames == 0 {
            return Ok(());
        }
        debug_assert!(out.len() >= frames * self.channels);

        let end_sample_time = start_sample_time + frames as i64;
        let clipped = match self.clip_to_bounds(start_sample_time, end_sample_time) {
            Ok(Some(range)) => range,
            Ok(None) => {
                out[..frames * self.channels].fill(0.0);
                return Err(RingBufferError::TooMuch);
            }
            Err(err) => {
                out[..frames * self.channels].fill(0.0);
                return Err(err);
            }
        };
        let (read_start, read_end) = clipped;

        // Silence for the parts of the request we don't have.
        let head = (read_start - start_sample_time) as usize;
        let tail = (end_sample_time - read_end) as usize;
        out[..head * self.channels].fill(0.0);
        let tail_offset = (frames - tail) * self.channels;
        out[tail_offset..frames * self.channels].fill(0.0);

        let data = unsafe { &*self.data.get() };
        let mut dst = head * self.channels;
        let mut offset = self.frame_offset(read_start);
        let mut remaining = (read_end - read_start) as usize * self.channels;
        while remaining > 0 {
            let run = remaining.min(data.len() - offset);
            out[dst..dst + run].copy_from_slice(&data[offset..offset + run]);
            offset = 0;
            dst += run;
            remaining -= run;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_value(t: i64, ch: usize) -> f32 {
        t as f32 + ch as f32 * 0.25
    }

    fn make_frames(start: i64, frames: usize, channels: usize) -> Vec<f32> {
        let mut v = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for ch in 0..channels {
                v.push(frame_value(start + i as i64, ch));
            }
        }
        v
    }

    #[test]
    fn test_store_then_fetch_round_trip() {
        let rb = RingBuffer::new(2, 512);
        let data = make_frames(100, 64, 2);
        rb.store(&data, 64, 100).unwrap();

        let mut out = vec![f32::NAN; 64 * 2];
        rb.fetch(&mut out, 64, 100).unwrap();
        assert_eq!(out, data);
        assert_eq!(rb.time_bounds().unwrap(), (100, 164));
    }

    #[test]
    fn test_fetch_partial_overlap_zero_fills() {
        let rb = RingBuffer::new(2, 512);
        let data = make_frames(100, 32, 2);
        rb.store(&data, 32, 100).unwrap();

        // Request starts 8 frames before the bounds and ends 8 after.
        let mut out = vec![f32::NAN; 48 * 2];
        rb.fetch(&mut out, 48, 92).unwrap();
        assert!(out[..8 * 2].iter().all(|&s| s == 0.0));
        assert_eq!(&out[8 * 2..40 * 2], &data[..]);
        assert!(out[40 * 2..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fetch_outside_bounds_is_too_much() {
        let rb = RingBuffer::new(2, 512);
        rb.store(&make_frames(100, 32, 2), 32, 100).unwrap();

        let mut out = vec![f32::NAN; 16 * 2];
        assert_eq!(
            rb.fetch(&mut out, 16, 1000),
            Err(RingBufferError::TooMuch)
        );
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_first_store_into_empty_buffer_sets_bounds_start() {
        let rb = RingBuffer::new(1, 64);
        rb.store(&make_frames(500, 16, 1), 16, 500).unwrap();
        assert_eq!(rb.time_bounds().unwrap(), (500, 516));

        // Nothing before the first write is fetchable.
        let mut out = vec![f32::NAN; 16];
        assert_eq!(rb.fetch(&mut out, 16, 400), Err(RingBufferError::TooMuch));
    }

    #[test]
    fn test_store_gap_zero_fills_gap() {
        let rb = RingBuffer::new(1, 256);
        rb.store(&make_frames(0, 32, 1), 32, 0).unwrap();
        // Leave a 16-frame hole.
        rb.store(&make_frames(48, 32, 1), 32, 48).unwrap();

        assert_eq!(rb.time_bounds().unwrap(), (0, 80));
        let mut out = vec![f32::NAN; 80];
        rb.fetch(&mut out, 80, 0).unwrap();
        assert_eq!(&out[..32], &make_frames(0, 32, 1)[..]);
        assert!(out[32..48].iter().all(|&s| s == 0.0));
        assert_eq!(&out[48..], &make_frames(48, 32, 1)[..]);
    }

    #[test]
    fn test_store_backwards_resets_bounds() {
        let rb = RingBuffer::new(1, 256);
        rb.store(&make_frames(1000, 32, 1), 32, 1000).unwrap();
        rb.store(&make_frames(10, 32, 1), 32, 10).unwrap();

        assert_eq!(rb.time_bounds().unwrap(), (10, 42));
        let mut out = vec![f32::NAN; 32];
        assert_eq!(
            rb.fetch(&mut out, 32, 1000),
            Err(RingBufferError::TooMuch)
        );
    }

    #[test]
    fn test_bounds_advance_past_overwritten_frames() {
        let rb = RingBuffer::new(1, 128);
        rb.store(&make_frames(0, 128, 1), 128, 0).unwrap();
        rb.store(&make_frames(128, 64, 1), 64, 128).unwrap();

        // The second store overwrote frames 0..64.
        assert_eq!(rb.time_bounds().unwrap(), (64, 192));
        let mut out = vec![f32::NAN; 128];
        rb.fetch(&mut out, 128, 64).unwrap();
        assert_eq!(&out[..64], &make_frames(64, 64, 1)[..]);
        assert_eq!(&out[64..], &make_frames(128, 64, 1)[..]);
    }

    #[test]
    fn test_store_larger_than_buffer_is_too_much() {
        let rb = RingBuffer::new(2, 64);
        let data = make_frames(0, 256, 2);
        assert_eq!(rb.store(&data, 256, 0), Err(RingBufferError::TooMuch));
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let rb = RingBuffer::new(2, 100);
        assert_eq!(rb.capacity_frames(), 128);
    }

    proptest! {
        // Sequential stores at advancing times: the most recent frames that
        // still fit must always fetch back exactly.
        #[test]
        fn prop_recent_frames_survive(
            writes in prop::collection::vec((1usize..64, 0i64..16), 1..20)
        ) {
            let rb = RingBuffer::new(2, 256);
            let mut t = 0i64;
            let mut last: Option<(i64, usize)> = None;

            for (frames, gap) in writes {
                t += gap;
                let data = make_frames(t, frames, 2);
                rb.store(&data, frames, t).unwrap();
                last = Some((t, frames));
                t += frames as i64;
            }

            let (start, frames) = last.unwrap();
            let mut out = vec![f32::NAN; frames * 2];
            rb.fetch(&mut out, frames, start).unwrap();
            prop_assert_eq!(out, make_frames(start, frames, 2));
        }
    }
}
