//! Per-stream training cache: a fixed-capacity ring of downsampled samples.
//!
//! The real-time producer appends with [`SampleCache::try_lock`] and never waits;
//! the training thread takes the blocking [`SampleCache::lock`]. The fill level is
//! mirrored into an atomic so displays can poll it without touching the lock.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::block::ChannelBuffer;
use crate::error::{IcaError, io_context};

/// Backing storage. Channel `c` occupies `data[c * capacity..(c + 1) * capacity]`.
struct CacheBuffer {
    channels: usize,
    capacity: usize,
    data: Vec<f32>,
    write_index: usize,
    written: usize,
}

impl CacheBuffer {
    fn new(channels: usize, capacity: usize) -> Self {
        let (capacity, len) = match channels.checked_mul(capacity) {
            Some(len) => (capacity, len),
            None => {
                warn!(channels, capacity, "cache size overflows, leaving it empty");
                (0, 0)
            }
        };
        Self {
            channels,
            capacity,
            data: vec![0.0; len],
            write_index: 0,
            written: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.written >= self.capacity
    }

    fn percent_full(&self) -> u8 {
        if self.capacity == 0 {
            return 100;
        }
        ((self.written * 100) / self.capacity).min(100) as u8
    }

    /// Physical index of the oldest retained sample.
    fn oldest_index(&self) -> usize {
        if self.is_full() { self.write_index } else { 0 }
    }

    fn channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.capacity;
        &self.data[start..start + self.capacity]
    }
}

/// Ring buffer of downsampled training data for one logical stream.
pub struct SampleCache {
    buffer: Mutex<CacheBuffer>,
    percent_full: AtomicU8,
}

impl SampleCache {
    /// Allocate an empty cache.
    pub fn new(channels: usize, capacity: usize) -> Self {
        let buffer = CacheBuffer::new(channels, capacity);
        let percent = buffer.percent_full();
        Self {
            buffer: Mutex::new(buffer),
            percent_full: AtomicU8::new(percent),
        }
    }

    /// Fill level in percent, readable without taking the lock.
    pub fn percent_full(&self) -> u8 {
        self.percent_full.load(Ordering::Acquire)
    }

    /// Acquire exclusive access, waiting for any holder to release it.
    pub fn lock(&self) -> CacheHandle<'_> {
        CacheHandle {
            buffer: self.buffer.lock(),
            percent_full: &self.percent_full,
        }
    }

    /// Acquire exclusive access only if nobody else holds it.
    pub fn try_lock(&self) -> Option<CacheHandle<'_>> {
        self.buffer.try_lock().map(|buffer| CacheHandle {
            buffer,
            percent_full: &self.percent_full,
        })
    }
}

/// Exclusive access to a [`SampleCache`]. All mutation goes through a handle.
pub struct CacheHandle<'a> {
    buffer: MutexGuard<'a, CacheBuffer>,
    percent_full: &'a AtomicU8,
}

impl CacheHandle<'_> {
    /// Cached channel count.
    pub fn channels(&self) -> usize {
        self.buffer.channels
    }

    /// Capacity in samples per channel.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity
    }

    /// Samples currently retained (saturates at capacity).
    pub fn written(&self) -> usize {
        self.buffer.written
    }

    /// Whether every slot holds a sample.
    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    /// Fill level in percent.
    pub fn percent_full(&self) -> u8 {
        self.buffer.percent_full()
    }

    fn publish(&self) {
        self.percent_full
            .store(self.buffer.percent_full(), Ordering::Release);
    }

    /// Discard all samples, keeping the allocation.
    pub fn reset(&mut self) {
        self.buffer.write_index = 0;
        self.buffer.written = 0;
        self.publish();
    }

    /// Reallocate for a new shape and discard all samples.
    pub fn reset_with_size(&mut self, channels: usize, capacity: usize) {
        *self.buffer = CacheBuffer::new(channels, capacity);
        self.publish();
    }

    /// Append one sample across all cached channels.
    ///
    /// Cached channel `k` reads `source.channel(mapping[k])[sample_index]`. Once
    /// full, each call overwrites the oldest sample.
    pub fn copy_sample<B>(&mut self, source: &B, mapping: &[usize], sample_index: usize)
    where
        B: ChannelBuffer + ?Sized,
    {
        let buffer = &mut *self.buffer;
        if buffer.capacity == 0 {
            return;
        }
        debug_assert_eq!(mapping.len(), buffer.channels);
        let capacity = buffer.capacity;
        let slot = buffer.write_index;
        for (cached, &source_channel) in mapping.iter().enumerate().take(buffer.channels) {
            buffer.data[cached * capacity + slot] = source.channel(source_channel)[sample_index];
        }
        buffer.write_index = (slot + 1) % capacity;
        if buffer.written < capacity {
            buffer.written += 1;
            self.publish();
        }
    }

    /// Change capacity while keeping the most recent `min(written, new_capacity)`
    /// samples in their original order.
    pub fn resize_keeping_data(&mut self, new_capacity: usize) {
        let old = &*self.buffer;
        if new_capacity == old.capacity {
            return;
        }
        let keep = old.written.min(new_capacity);
        let mut resized = CacheBuffer::new(old.channels, new_capacity);

        if keep > 0 {
            // Logical window of the kept samples, which may wrap past the end of
            // the old storage.
            let start = (old.write_index + old.capacity - keep) % old.capacity;
            let first_len = keep.min(old.capacity - start);
            let second_len = keep - first_len;
            for channel in 0..old.channels {
                let src = old.channel(channel);
                let dst_start = channel * new_capacity;
                let dst = &mut resized.data[dst_start..dst_start + new_capacity];
                dst[..first_len].copy_from_slice(&src[start..start + first_len]);
                dst[first_len..keep].copy_from_slice(&src[..second_len]);
            }
        }

        resized.written = keep;
        resized.write_index = if new_capacity == 0 {
            0
        } else {
            keep % new_capacity
        };
        *self.buffer = resized;
        self.publish();
    }

    /// Retained samples of the given cached channels, oldest first, interleaved
    /// so that each time step lists `channels` in order.
    pub fn ordered_samples(&self, channels: &[usize]) -> Vec<f32> {
        let buffer = &*self.buffer;
        let count = buffer.written.min(buffer.capacity);
        let oldest = buffer.oldest_index();
        let mut out = Vec::with_capacity(count * channels.len());
        for step in 0..count {
            let slot = (oldest + step) % buffer.capacity;
            for &channel in channels {
                out.push(buffer.channel(channel)[slot]);
            }
        }
        out
    }

    /// Write a full cache to `path` as little-endian `f32`, oldest sample first,
    /// each time step listing `channels` in the given order.
    pub fn write_channels_to_file(&self, path: &Path, channels: &[usize]) -> Result<(), IcaError> {
        if !self.is_full() {
            return Err(IcaError::CacheNotFull(self.percent_full()));
        }
        debug_assert!(channels.iter().all(|&c| c < self.buffer.channels));

        let file = File::create(path).map_err(io_context("creating training data file", path))?;
        let mut writer = BufWriter::new(file);
        let buffer = &*self.buffer;
        let oldest = buffer.oldest_index();
        for step in 0..buffer.capacity {
            let slot = (oldest + step) % buffer.capacity;
            for &channel in channels {
                writer
                    .write_all(&buffer.channel(channel)[slot].to_le_bytes())
                    .map_err(io_context("writing training data", path))?;
            }
        }
        writer
            .flush()
            .map_err(io_context("writing training data", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `count` samples where cached channel `c` at step `n` holds `c * 1000 + n`.
    fn feed(cache: &SampleCache, channels: usize, count: usize, offset: usize) {
        let mut handle = cache.lock();
        let block: Vec<Vec<f32>> = (0..channels)
            .map(|c| (0..count).map(|n| (c * 1000 + offset + n) as f32).collect())
            .collect();
        let mapping: Vec<usize> = (0..channels).collect();
        for n in 0..count {
            handle.copy_sample(&block, &mapping, n);
        }
    }

    fn expected(channels: &[usize], first: usize, last_exclusive: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for n in first..last_exclusive {
            for &c in channels {
                out.push((c * 1000 + n) as f32);
            }
        }
        out
    }

    #[test]
    fn overwrites_oldest_once_full() {
        for channels in 1..4 {
            for capacity in 0..6 {
                let cache = SampleCache::new(channels, capacity);
                feed(&cache, channels, capacity * 2 + 3, 0);
                let all: Vec<usize> = (0..channels).collect();
                let total = capacity * 2 + 3;
                let handle = cache.lock();
                assert!(handle.is_full());
                assert_eq!(
                    handle.ordered_samples(&all),
                    expected(&all, total - capacity, total),
                    "channels={channels} capacity={capacity}"
                );
            }
        }
    }

    #[test]
    fn percent_full_tracks_writes_and_saturates() {
        let cache = SampleCache::new(2, 4);
        assert_eq!(cache.percent_full(), 0);
        feed(&cache, 2, 1, 0);
        assert_eq!(cache.percent_full(), 25);
        feed(&cache, 2, 3, 1);
        assert_eq!(cache.percent_full(), 100);
        feed(&cache, 2, 5, 4);
        assert_eq!(cache.percent_full(), 100);
        cache.lock().reset();
        assert_eq!(cache.percent_full(), 0);
    }

    #[test]
    fn overflowing_shape_allocates_nothing() {
        let cache = SampleCache::new(usize::MAX / 2, 4);
        let mut handle = cache.lock();
        assert_eq!(handle.capacity(), 0);
        handle.reset_with_size(2, usize::MAX);
        assert_eq!(handle.capacity(), 0);
        handle.reset_with_size(2, 3);
        assert_eq!(handle.capacity(), 3);
    }

    #[test]
    fn zero_capacity_cache_reports_full() {
        let cache = SampleCache::new(3, 0);
        assert_eq!(cache.percent_full(), 100);
        assert!(cache.lock().ordered_samples(&[0, 1, 2]).is_empty());
    }

    #[test]
    fn resize_preserves_recent_window_across_wrap() {
        // capacity 5, 8 samples written: physical layout wraps at index 3.
        let cache = SampleCache::new(2, 5);
        feed(&cache, 2, 8, 0);
        let mut handle = cache.lock();
        handle.resize_keeping_data(4);
        assert_eq!(handle.written(), 4);
        assert!(handle.is_full());
        assert_eq!(handle.ordered_samples(&[0, 1]), expected(&[0, 1], 4, 8));

        handle.resize_keeping_data(10);
        assert_eq!(handle.written(), 4);
        assert_eq!(handle.percent_full(), 40);
        assert_eq!(handle.ordered_samples(&[1, 0]), expected(&[1, 0], 4, 8));
    }

    #[test]
    fn resize_of_partial_cache_keeps_everything_that_fits() {
        let cache = SampleCache::new(1, 8);
        feed(&cache, 1, 3, 0);
        let mut handle = cache.lock();
        handle.resize_keeping_data(2);
        assert_eq!(handle.ordered_samples(&[0]), vec![1.0, 2.0]);
        handle.resize_keeping_data(0);
        assert_eq!(handle.written(), 0);
        assert!(handle.is_full());
    }

    #[test]
    fn appends_after_resize_continue_in_order() {
        let cache = SampleCache::new(1, 3);
        feed(&cache, 1, 5, 0);
        cache.lock().resize_keeping_data(4);
        feed(&cache, 1, 2, 5);
        assert_eq!(
            cache.lock().ordered_samples(&[0]),
            vec![3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn try_lock_fails_fast_while_held() {
        let cache = SampleCache::new(1, 4);
        let held = cache.lock();
        assert!(cache.try_lock().is_none());
        drop(held);
        assert!(cache.try_lock().is_some());
    }

    #[test]
    fn write_requires_full_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.floatdata");
        let cache = SampleCache::new(2, 4);
        feed(&cache, 2, 2, 0);
        let err = cache.lock().write_channels_to_file(&path, &[0, 1]).unwrap_err();
        assert!(matches!(err, IcaError::CacheNotFull(50)));
    }

    #[test]
    fn writes_little_endian_time_ordered_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.floatdata");
        let cache = SampleCache::new(3, 3);
        feed(&cache, 3, 7, 0);
        cache.lock().write_channels_to_file(&path, &[2, 0]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values, expected(&[2, 0], 4, 7));
    }
}
