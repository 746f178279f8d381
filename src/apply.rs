//! Real-time component selection: `x <- M * S * U * x` on the enabled channels,
//! where `S` keeps or drops components.
//!
//! Only the smaller of the kept/rejected sets is ever materialised. Rejecting a
//! few components subtracts their reconstruction from the input; keeping a few
//! zeroes the enabled channels and adds back only the kept reconstructions.

use crate::block::ChannelBuffer;
use crate::operation::Decomposition;

/// Frames processed per pass through the scratch buffer.
pub const CHUNK_FRAMES: usize = 256;

/// How the working component set is remixed into the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Zero the enabled channels, then add back the working components.
    Additive,
    /// Subtract the working components from the enabled channels.
    Subtractive,
}

/// Scratch state for one stream's applicator. Sized once, reused every block.
pub struct TransformApplicator {
    scratch: Vec<f32>,
    components: Vec<usize>,
}

impl TransformApplicator {
    /// Preallocate for decompositions of up to `max_dimension` components.
    pub fn new(max_dimension: usize) -> Self {
        let max_working = max_dimension.div_ceil(2).max(1);
        Self {
            scratch: vec![0.0; max_working * CHUNK_FRAMES],
            components: Vec::with_capacity(max_dimension),
        }
    }

    /// Largest working set the scratch can hold in one pass.
    fn max_working(&self) -> usize {
        self.scratch.len() / CHUNK_FRAMES
    }

    /// Apply `op` to `block`, choosing the cheaper of the two modes.
    ///
    /// `channel_map[k]` is the block channel holding stream channel `k`.
    pub fn apply<B>(&mut self, op: &Decomposition, block: &mut B, channel_map: &[usize])
    where
        B: ChannelBuffer + ?Sized,
    {
        if op.is_noop() {
            return;
        }
        let dimension = op.dimension();
        let rejected = op.rejected_components().len();
        self.components.clear();
        let mode = if rejected <= dimension - rejected {
            self.components.extend(op.rejected_components().iter().copied());
            ApplyMode::Subtractive
        } else {
            self.components.extend(op.kept_components());
            ApplyMode::Additive
        };
        self.run(op, block, channel_map, mode);
    }

    /// Apply with an explicit working set and mode.
    ///
    /// `Subtractive` with the rejected set and `Additive` with the kept set
    /// produce the same output up to rounding.
    pub fn apply_with<B>(
        &mut self,
        op: &Decomposition,
        block: &mut B,
        channel_map: &[usize],
        components: &[usize],
        mode: ApplyMode,
    ) where
        B: ChannelBuffer + ?Sized,
    {
        if op.is_noop() {
            return;
        }
        self.components.clear();
        self.components.extend_from_slice(components);
        self.run(op, block, channel_map, mode);
    }

    fn run<B>(&mut self, op: &Decomposition, block: &mut B, channel_map: &[usize], mode: ApplyMode)
    where
        B: ChannelBuffer + ?Sized,
    {
        let enabled = op.enabled_channels();
        if enabled
            .iter()
            .any(|&c| c >= channel_map.len() || channel_map[c] >= block.num_channels())
        {
            return;
        }
        if self.components.len() > self.max_working() {
            // Only reachable with `apply_with` on an oversized set; grow once.
            self.scratch.resize(self.components.len() * CHUNK_FRAMES, 0.0);
        }

        let unmixing = op.unmixing();
        let mixing = op.mixing();
        let total = block.num_samples();
        let mut start = 0;
        while start < total {
            let frames = CHUNK_FRAMES.min(total - start);
            let end = start + frames;

            // Component time series for this chunk; all are computed before any
            // channel is rewritten.
            for (slot, &component) in self.components.iter().enumerate() {
                let series = &mut self.scratch[slot * CHUNK_FRAMES..slot * CHUNK_FRAMES + frames];
                series.fill(0.0);
                for (j, &channel) in enabled.iter().enumerate() {
                    let weight = unmixing[(component, j)];
                    if weight == 0.0 {
                        continue;
                    }
                    let input = &block.channel(channel_map[channel])[start..end];
                    for (out, sample) in series.iter_mut().zip(input) {
                        *out += weight * sample;
                    }
                }
            }

            if mode == ApplyMode::Additive {
                for &channel in enabled {
                    block.channel_mut(channel_map[channel])[start..end].fill(0.0);
                }
            }

            let sign = match mode {
                ApplyMode::Additive => 1.0f32,
                ApplyMode::Subtractive => -1.0f32,
            };
            for (slot, &component) in self.components.iter().enumerate() {
                let series = &self.scratch[slot * CHUNK_FRAMES..slot * CHUNK_FRAMES + frames];
                for (j, &channel) in enabled.iter().enumerate() {
                    let weight = sign * mixing[(j, component)];
                    if weight == 0.0 {
                        continue;
                    }
                    let output = &mut block.channel_mut(channel_map[channel])[start..end];
                    for (out, value) in output.iter_mut().zip(series) {
                        *out += weight * value;
                    }
                }
            }

            start = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nalgebra::DMatrix;

    use super::*;
    use crate::block::PlanarBuffer;

    fn decomposition(mixing: DMatrix<f32>, rejected: &[usize]) -> Decomposition {
        let n = mixing.nrows();
        let unmixing = mixing.clone().try_inverse().unwrap();
        Decomposition::new(
            mixing,
            unmixing,
            (0..n).collect(),
            rejected.iter().copied().collect::<BTreeSet<_>>(),
        )
        .unwrap()
    }

    fn mixing_3x3() -> DMatrix<f32> {
        DMatrix::from_row_slice(3, 3, &[1.0, 0.5, 0.2, 0.3, 1.0, 0.4, 0.1, 0.6, 1.0])
    }

    fn sine_block(channels: usize, frames: usize) -> Vec<Vec<f32>> {
        (0..channels)
            .map(|c| {
                (0..frames)
                    .map(|n| ((n as f32) * 0.05 * (c + 1) as f32).sin() + c as f32 * 0.1)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn rejecting_one_of_four_identity_components_zeroes_that_channel() {
        let op = decomposition(DMatrix::identity(4, 4), &[0]);
        let mut block = PlanarBuffer::from_channels(&[
            vec![1.0; 8],
            vec![2.0; 8],
            vec![2.0; 8],
            vec![2.0; 8],
        ]);
        let mut applicator = TransformApplicator::new(4);
        applicator.apply(&op, &mut block, &[0, 1, 2, 3]);
        assert!(block.channel(0).iter().all(|&s| s == 0.0));
        for channel in 1..4 {
            assert!(block.channel(channel).iter().all(|&s| s == 2.0));
        }
    }

    #[test]
    fn keeping_everything_additively_is_identity() {
        let op = decomposition(mixing_3x3(), &[]);
        let original = sine_block(3, 600);
        let mut block = original.clone();
        let mut applicator = TransformApplicator::new(3);
        applicator.apply_with(&op, &mut block, &[0, 1, 2], &[0, 1, 2], ApplyMode::Additive);
        for (out, input) in block.iter().zip(&original) {
            for (a, b) in out.iter().zip(input) {
                assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn rejecting_everything_is_exactly_zero() {
        let op = decomposition(mixing_3x3(), &[0, 1, 2]);
        let mut block = sine_block(3, 300);
        let mut applicator = TransformApplicator::new(3);
        applicator.apply(&op, &mut block, &[0, 1, 2]);
        assert!(block.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn subtracting_all_components_is_near_zero() {
        let op = decomposition(mixing_3x3(), &[0, 1, 2]);
        let mut block = sine_block(3, 300);
        let mut applicator = TransformApplicator::new(3);
        applicator.apply_with(&op, &mut block, &[0, 1, 2], &[0, 1, 2], ApplyMode::Subtractive);
        assert!(block.iter().flatten().all(|&s| s.abs() < 1e-4));
    }

    #[test]
    fn additive_and_subtractive_paths_agree() {
        let op = decomposition(mixing_3x3(), &[1]);
        let original = sine_block(3, 257);

        let mut subtractive = original.clone();
        let mut applicator = TransformApplicator::new(3);
        applicator.apply_with(&op, &mut subtractive, &[0, 1, 2], &[1], ApplyMode::Subtractive);

        let mut additive = original.clone();
        applicator.apply_with(&op, &mut additive, &[0, 1, 2], &[0, 2], ApplyMode::Additive);

        for (a, b) in subtractive.iter().flatten().zip(additive.iter().flatten()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn single_kept_component_is_its_mixing_column_times_activation() {
        let mixing = mixing_3x3();
        let op = decomposition(mixing.clone(), &[0, 2]);
        let original = sine_block(3, 64);
        let mut block = original.clone();
        let mut applicator = TransformApplicator::new(3);
        applicator.apply(&op, &mut block, &[0, 1, 2]);

        let unmixing = op.unmixing();
        for n in 0..64 {
            let activation: f32 = (0..3).map(|j| unmixing[(1, j)] * original[j][n]).sum();
            for channel in 0..3 {
                let expected = mixing[(channel, 1)] * activation;
                assert!((block[channel][n] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn channels_outside_the_decomposition_pass_through() {
        let mixing = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.25, 1.0]);
        let unmixing = mixing.clone().try_inverse().unwrap();
        // Stream channels 1 and 3 are enabled; block has the stream at an offset.
        let op = Decomposition::new(mixing, unmixing, vec![1, 3], BTreeSet::from([0])).unwrap();
        let original = sine_block(5, 40);
        let mut block = original.clone();
        let channel_map = [1, 2, 3, 4];
        let mut applicator = TransformApplicator::new(4);
        applicator.apply(&op, &mut block, &channel_map);

        assert_eq!(block[0], original[0]);
        assert_eq!(block[1], original[1]);
        assert_eq!(block[3], original[3]);
        assert_ne!(block[2], original[2]);
        assert_ne!(block[4], original[4]);
    }

    #[test]
    fn noop_leaves_block_untouched() {
        let original = sine_block(2, 16);
        let mut block = original.clone();
        TransformApplicator::new(2).apply(&Decomposition::noop(), &mut block, &[0, 1]);
        assert_eq!(block, original);
    }
}
