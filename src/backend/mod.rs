//! Pluggable decomposition backends.
//!
//! The training thread writes the data and config files, then hands a
//! [`EngineJob`] to a backend which returns the raw `weights`/`sphere` pair.
//! Everything numeric after that (normalisation, inversion) is backend
//! independent and lives in [`crate::training`].
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;

use crate::error::IcaError;
use crate::persist::{CONFIG_FILE, TrainingConfigFile};
use crate::training::CancelToken;

mod binica;
pub mod process;
mod whitening;

pub use binica::BinicaBackend;
pub use whitening::WhiteningBackend;

/// Files and shape of one decomposition request.
#[derive(Clone, Debug)]
pub struct EngineJob {
    /// Run directory all relative names resolve against.
    pub directory: PathBuf,
    /// Parsed contents of the config file.
    pub config: TrainingConfigFile,
}

impl EngineJob {
    /// Job for a config living in `directory`.
    pub fn new(directory: PathBuf, config: TrainingConfigFile) -> Self {
        Self { directory, config }
    }

    /// Channel count (N).
    pub fn channels(&self) -> usize {
        self.config.channels()
    }

    /// Frame count (T).
    pub fn frames(&self) -> usize {
        self.config.frames
    }

    /// Engine config file path.
    pub fn config_path(&self) -> PathBuf {
        self.directory.join(CONFIG_FILE)
    }

    /// Training data path.
    pub fn data_path(&self) -> PathBuf {
        self.resolve(&self.config.data_file)
    }

    /// Weight matrix output path.
    pub fn weights_path(&self) -> PathBuf {
        self.resolve(&self.config.weights_file)
    }

    /// Sphering matrix output path.
    pub fn sphere_path(&self) -> PathBuf {
        self.resolve(&self.config.sphere_file)
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }
}

/// Raw engine result: two N x N matrices.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineOutput {
    /// Weight matrix `W`.
    pub weights: DMatrix<f32>,
    /// Sphering matrix `S`.
    pub sphere: DMatrix<f32>,
}

/// Anything that can turn N channels x T samples into a weights/sphere pair.
pub trait DecompositionBackend: Send + Sync {
    /// Short name for logs and status lines.
    fn name(&self) -> &str;

    /// Run the decomposition. Implementations must poll `cancel` at every wait
    /// and return [`IcaError::Cancelled`] promptly once it is set.
    fn decompose(&self, job: &EngineJob, cancel: &CancelToken) -> Result<EngineOutput, IcaError>;
}
