use std::fs::File;

use memmap2::Mmap;
use nalgebra::DMatrix;
use tracing::debug;

use super::{DecompositionBackend, EngineJob, EngineOutput};
use crate::error::{IcaError, io_context};
use crate::training::CancelToken;

/// Eigenvalues below this fraction of the largest are treated as zero variance.
const MIN_RELATIVE_VARIANCE: f64 = 1e-12;
/// Frames accumulated between cancellation checks.
const CANCEL_CHECK_FRAMES: usize = 4_096;

/// In-process backend producing a pure sphering solution.
///
/// `sphere = 2 * C^(-1/2)` of the channel covariance `C` (the same scaling the
/// external engine uses for its sphering step) and `weights = I`. The result
/// decorrelates channels without any higher-order separation, which is enough
/// to exercise the pipeline when the engine binary is unavailable.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhiteningBackend;

impl DecompositionBackend for WhiteningBackend {
    fn name(&self) -> &str {
        "whitening"
    }

    fn decompose(&self, job: &EngineJob, cancel: &CancelToken) -> Result<EngineOutput, IcaError> {
        let n = job.channels();
        let frames = job.frames();
        if frames < 2 {
            return Err(IcaError::SingularMatrix);
        }
        let path = job.data_path();
        let file = File::open(&path).map_err(io_context("opening training data", &path))?;
        // Safety: the run directory is private to this training run and the
        // file is not modified while mapped.
        let map = unsafe { Mmap::map(&file) }.map_err(io_context("mapping training data", &path))?;
        let expected = n * frames * 4;
        if map.len() != expected {
            return Err(IcaError::MatrixLength {
                path,
                found: map.len() / 4,
                expected: n * frames,
            });
        }

        let sample = |frame: usize, channel: usize| -> f64 {
            let offset = (frame * n + channel) * 4;
            f32::from_le_bytes([map[offset], map[offset + 1], map[offset + 2], map[offset + 3]])
                as f64
        };

        let mut mean = vec![0.0f64; n];
        for frame in 0..frames {
            if frame % CANCEL_CHECK_FRAMES == 0 && cancel.is_cancelled() {
                return Err(IcaError::Cancelled);
            }
            for (channel, m) in mean.iter_mut().enumerate() {
                *m += sample(frame, channel);
            }
        }
        mean.iter_mut().for_each(|m| *m /= frames as f64);

        let mut covariance = DMatrix::<f64>::zeros(n, n);
        let mut centred = vec![0.0f64; n];
        for frame in 0..frames {
            if frame % CANCEL_CHECK_FRAMES == 0 && cancel.is_cancelled() {
                return Err(IcaError::Cancelled);
            }
            for (channel, value) in centred.iter_mut().enumerate() {
                *value = sample(frame, channel) - mean[channel];
            }
            for i in 0..n {
                for j in i..n {
                    covariance[(i, j)] += centred[i] * centred[j];
                }
            }
        }
        for i in 0..n {
            for j in i..n {
                let value = covariance[(i, j)] / (frames - 1) as f64;
                covariance[(i, j)] = value;
                covariance[(j, i)] = value;
            }
        }

        let eigen = covariance.symmetric_eigen();
        let largest = eigen.eigenvalues.iter().cloned().fold(0.0f64, f64::max);
        if largest <= 0.0
            || eigen
                .eigenvalues
                .iter()
                .any(|&v| v <= largest * MIN_RELATIVE_VARIANCE)
        {
            return Err(IcaError::SingularMatrix);
        }
        let inv_sqrt = DMatrix::from_diagonal(&eigen.eigenvalues.map(|v| 1.0 / v.sqrt()));
        let sphere = &eigen.eigenvectors * inv_sqrt * eigen.eigenvectors.transpose() * 2.0;
        debug!(channels = n, frames, "whitening solution computed");

        Ok(EngineOutput {
            weights: DMatrix::identity(n, n),
            sphere: sphere.map(|v| v as f32),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::persist::TrainingConfigFile;

    fn write_data(job: &EngineJob, frames: &[[f32; 2]]) {
        let mut file = File::create(job.data_path()).unwrap();
        for frame in frames {
            for value in frame {
                file.write_all(&value.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn sphere_whitens_the_training_data() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<[f32; 2]> = (0..2000)
            .map(|n| {
                let a = (n as f32 * 0.013).sin();
                let b = (n as f32 * 0.071).cos();
                [a + 0.5 * b, 0.3 * a + b]
            })
            .collect();
        let job = EngineJob::new(
            dir.path().to_path_buf(),
            TrainingConfigFile::new(vec![0, 1], frames.len()),
        );
        write_data(&job, &frames);

        let output = WhiteningBackend.decompose(&job, &CancelToken::new()).unwrap();
        assert_eq!(output.weights, DMatrix::identity(2, 2));

        // Covariance of S * x should be 4 * I.
        let mut cov = [[0.0f64; 2]; 2];
        let mut mean = [0.0f64; 2];
        let projected: Vec<[f64; 2]> = frames
            .iter()
            .map(|f| {
                let s = &output.sphere;
                [
                    (s[(0, 0)] * f[0] + s[(0, 1)] * f[1]) as f64,
                    (s[(1, 0)] * f[0] + s[(1, 1)] * f[1]) as f64,
                ]
            })
            .collect();
        for p in &projected {
            mean[0] += p[0] / projected.len() as f64;
            mean[1] += p[1] / projected.len() as f64;
        }
        for p in &projected {
            for i in 0..2 {
                for j in 0..2 {
                    cov[i][j] += (p[i] - mean[i]) * (p[j] - mean[j]) / (projected.len() - 1) as f64;
                }
            }
        }
        assert!((cov[0][0] - 4.0).abs() < 1e-2);
        assert!((cov[1][1] - 4.0).abs() < 1e-2);
        assert!(cov[0][1].abs() < 1e-2);
    }

    #[test]
    fn constant_channel_is_singular() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<[f32; 2]> = (0..100).map(|n| [n as f32, 1.0]).collect();
        let job = EngineJob::new(
            dir.path().to_path_buf(),
            TrainingConfigFile::new(vec![0, 1], frames.len()),
        );
        write_data(&job, &frames);
        let err = WhiteningBackend.decompose(&job, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, IcaError::SingularMatrix));
    }

    #[test]
    fn short_data_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = EngineJob::new(
            dir.path().to_path_buf(),
            TrainingConfigFile::new(vec![0, 1], 50),
        );
        write_data(&job, &[[1.0, 2.0]]);
        let err = WhiteningBackend.decompose(&job, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, IcaError::MatrixLength { found: 2, expected: 100, .. }));
    }
}
