//! Planar sample blocks handed to the processor by the host.

use std::slice;

/// Per-channel (non-interleaved) `f32` sample storage.
///
/// The real-time path only ever reads or rewrites samples in place through this
/// trait, so hosts can hand over whatever layout they already own.
pub trait ChannelBuffer {
    /// Number of channels in the block.
    fn num_channels(&self) -> usize;
    /// Samples per channel.
    fn num_samples(&self) -> usize;
    /// Immutable view of one channel.
    fn channel(&self, index: usize) -> &[f32];
    /// Mutable view of one channel.
    fn channel_mut(&mut self, index: usize) -> &mut [f32];
}

impl ChannelBuffer for [Vec<f32>] {
    fn num_channels(&self) -> usize {
        self.len()
    }

    fn num_samples(&self) -> usize {
        self.iter().map(Vec::len).min().unwrap_or(0)
    }

    fn channel(&self, index: usize) -> &[f32] {
        &self[index]
    }

    fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self[index]
    }
}

impl ChannelBuffer for Vec<Vec<f32>> {
    fn num_channels(&self) -> usize {
        self.as_slice().num_channels()
    }

    fn num_samples(&self) -> usize {
        self.as_slice().num_samples()
    }

    fn channel(&self, index: usize) -> &[f32] {
        &self[index]
    }

    fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self[index]
    }
}

/// Owned planar buffer with equal-length channels stored back to back.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanarBuffer {
    data: Vec<f32>,
    channels: usize,
    samples: usize,
}

impl PlanarBuffer {
    /// Zero-filled buffer.
    pub fn new(channels: usize, samples: usize) -> Self {
        Self {
            data: vec![0.0; channels * samples],
            channels,
            samples,
        }
    }

    /// Build from per-channel vectors; shorter channels are zero padded.
    pub fn from_channels(channels: &[Vec<f32>]) -> Self {
        let samples = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut buffer = Self::new(channels.len(), samples);
        for (index, source) in channels.iter().enumerate() {
            buffer.channel_mut(index)[..source.len()].copy_from_slice(source);
        }
        buffer
    }

    /// Set every sample to zero.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }
}

impl ChannelBuffer for PlanarBuffer {
    fn num_channels(&self) -> usize {
        self.channels
    }

    fn num_samples(&self) -> usize {
        self.samples
    }

    fn channel(&self, index: usize) -> &[f32] {
        let start = index * self.samples;
        &self.data[start..start + self.samples]
    }

    fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.samples;
        &mut self.data[start..start + self.samples]
    }
}

/// Borrowed view over an array of host-owned channel pointers.
pub struct RawChannels<'a> {
    pointers: &'a [*mut f32],
    samples: usize,
}

impl<'a> RawChannels<'a> {
    /// Wrap an array of channel pointers.
    ///
    /// # Safety
    /// Every pointer must be valid for reads and writes of `samples` floats for
    /// the lifetime `'a`, and no two pointers may alias.
    pub unsafe fn new(pointers: &'a [*mut f32], samples: usize) -> Self {
        Self { pointers, samples }
    }
}

impl ChannelBuffer for RawChannels<'_> {
    fn num_channels(&self) -> usize {
        self.pointers.len()
    }

    fn num_samples(&self) -> usize {
        self.samples
    }

    fn channel(&self, index: usize) -> &[f32] {
        unsafe { slice::from_raw_parts(self.pointers[index], self.samples) }
    }

    fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        unsafe { slice::from_raw_parts_mut(self.pointers[index], self.samples) }
    }
}
