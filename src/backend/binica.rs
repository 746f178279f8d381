use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use super::process::EngineProcess;
use super::{DecompositionBackend, EngineJob, EngineOutput};
use crate::error::IcaError;
use crate::persist::read_matrix;
use crate::training::CancelToken;

/// Runs the external `binica` executable against the job's config file.
pub struct BinicaBackend {
    program: PathBuf,
    poll_interval: Duration,
}

impl BinicaBackend {
    /// Backend launching `program`, polling it every `poll_interval`.
    pub fn new(program: PathBuf, poll_interval: Duration) -> Self {
        Self {
            program,
            poll_interval,
        }
    }
}

impl DecompositionBackend for BinicaBackend {
    fn name(&self) -> &str {
        "binica"
    }

    fn decompose(&self, job: &EngineJob, cancel: &CancelToken) -> Result<EngineOutput, IcaError> {
        let mut process = EngineProcess::launch(&self.program, &job.config_path());
        if process.failed_to_run() {
            return Err(IcaError::EngineLaunch(self.program.clone()));
        }
        info!(program = ?self.program, channels = job.channels(), frames = job.frames(), "engine running");

        while process.is_running() {
            if cancel.is_cancelled() {
                warn!("cancelling decomposition engine");
                process.terminate();
                return Err(IcaError::Cancelled);
            }
            std::thread::sleep(self.poll_interval);
        }

        match process.exit_code() {
            Some(0) => {}
            Some(code) => return Err(IcaError::EngineExit(code)),
            None => return Err(IcaError::EngineLaunch(self.program.clone())),
        }

        let n = job.channels();
        Ok(EngineOutput {
            weights: read_matrix(&job.weights_path(), n)?,
            sphere: read_matrix(&job.sphere_path(), n)?,
        })
    }
}
