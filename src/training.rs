//! Background training: wait for a full cache, hand the data to a backend,
//! turn its output into a mixing/unmixing pair and install it.
//!
//! Only one run is active per [`Trainer`]. Every wait point checks the run's
//! [`CancelToken`]; a cancelled run removes its directory, a failed run keeps
//! it for diagnosis, and neither touches the stream's installed decomposition.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use chrono::Local;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use nalgebra::DMatrix;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::backend::{DecompositionBackend, EngineJob};
use crate::cache::CacheHandle;
use crate::config::IcaConfig;
use crate::error::{IcaError, io_context};
use crate::persist::{
    CONFIG_FILE, DATA_FILE, MIXING_FILE, TrainingConfigFile, UNMIXING_FILE, read_matrix,
    write_matrix,
};
use crate::push_status;
use crate::registry::{StreamId, StreamState};

/// Smallest accepted ratio between the smallest and largest singular value of
/// the unmixing matrix.
const MIN_RECIPROCAL_CONDITION: f64 = 1e-7;
/// Events buffered for subscribers before new ones are dropped.
const EVENT_CAPACITY: usize = 64;

/// Shared cancellation flag for one training run.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), IcaError> {
        if self.is_cancelled() {
            Err(IcaError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Step a run is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingStage {
    /// Polling the cache until it is full.
    AwaitingData,
    /// Writing the cached samples to the run directory.
    WritingData,
    /// Backend is decomposing the data.
    RunningEngine,
    /// Normalising and inverting the backend output.
    ComputingMatrices,
    /// Swapping the new decomposition in.
    Installing,
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TrainingStage::AwaitingData => "waiting for training data",
            TrainingStage::WritingData => "writing training data",
            TrainingStage::RunningEngine => "running ICA",
            TrainingStage::ComputingMatrices => "computing mixing matrix",
            TrainingStage::Installing => "installing decomposition",
        };
        f.write_str(text)
    }
}

/// Progress notification published by the training thread.
#[derive(Clone, Debug, PartialEq)]
pub enum TrainingEvent {
    /// A run began for `stream`.
    Started {
        /// Target stream.
        stream: StreamId,
    },
    /// The run entered `stage`.
    Stage {
        /// Target stream.
        stream: StreamId,
        /// New stage.
        stage: TrainingStage,
    },
    /// The run installed a decomposition produced in `directory`.
    Finished {
        /// Target stream.
        stream: StreamId,
        /// Run directory.
        directory: PathBuf,
    },
    /// The run failed.
    Failed {
        /// Target stream.
        stream: StreamId,
        /// Human-readable reason.
        message: String,
    },
    /// The run was cancelled.
    Cancelled {
        /// Target stream.
        stream: StreamId,
    },
}

/// Everything a run needs, snapshotted when it starts.
pub(crate) struct TrainingRequest {
    pub stream_id: StreamId,
    pub state: Arc<StreamState>,
    pub channels: Vec<usize>,
    pub config: IcaConfig,
}

/// Normalise the sphering matrix by its largest singular value and derive
/// `unmixing = weights * sphere'` and `mixing = unmixing^-1`.
///
/// Returns `(mixing, unmixing)`.
pub fn compute_mixing(
    weights: &DMatrix<f32>,
    sphere: &DMatrix<f32>,
) -> Result<(DMatrix<f32>, DMatrix<f32>), IcaError> {
    if !weights.is_square() || weights.shape() != sphere.shape() || weights.nrows() == 0 {
        return Err(IcaError::ChannelMismatch(format!(
            "weights are {}x{} but sphere is {}x{}",
            weights.nrows(),
            weights.ncols(),
            sphere.nrows(),
            sphere.ncols()
        )));
    }
    let weights = weights.map(f64::from);
    let sphere = sphere.map(f64::from);

    let sigma_max = sphere.singular_values().max();
    if !sigma_max.is_finite() || sigma_max <= 0.0 {
        return Err(IcaError::SingularMatrix);
    }
    let unmixing = &weights * (sphere / sigma_max);

    let singular = unmixing.singular_values();
    let (largest, smallest) = (singular.max(), singular.min());
    if !largest.is_finite() || smallest <= largest * MIN_RECIPROCAL_CONDITION {
        return Err(IcaError::SingularMatrix);
    }
    let mixing = unmixing
        .clone()
        .try_inverse()
        .ok_or(IcaError::SingularMatrix)?;

    Ok((mixing.map(|v| v as f32), unmixing.map(|v| v as f32)))
}

/// Matrices and channel set recovered from a run directory.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedRun {
    /// Mixing matrix.
    pub mixing: DMatrix<f32>,
    /// Unmixing matrix.
    pub unmixing: DMatrix<f32>,
    /// Stream-relative channels from the config's hint line.
    pub enabled_channels: Vec<usize>,
}

/// Read a finished run back from its engine config file.
///
/// Uses `mixing.mat`/`unmixing.mat` when both exist, otherwise derives them
/// from the engine's weights and sphere and writes them next to the config.
pub fn load_run(config_file: &Path) -> Result<LoadedRun, IcaError> {
    let config = TrainingConfigFile::read(config_file)?;
    let n = config.channels();
    if n < 2 {
        return Err(IcaError::TooFewChannels(n));
    }
    let directory = config_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mixing_path = directory.join(MIXING_FILE);
    let unmixing_path = directory.join(UNMIXING_FILE);

    let enabled_channels = config.enabled_channels.clone();

    let (mixing, unmixing) = if mixing_path.exists() && unmixing_path.exists() {
        (read_matrix(&mixing_path, n)?, read_matrix(&unmixing_path, n)?)
    } else {
        let job = EngineJob::new(directory, config);
        let weights = read_matrix(&job.weights_path(), n)?;
        let sphere = read_matrix(&job.sphere_path(), n)?;
        let (mixing, unmixing) = compute_mixing(&weights, &sphere)?;
        write_matrix(&mixing_path, &mixing)?;
        write_matrix(&unmixing_path, &unmixing)?;
        debug!(?mixing_path, "derived mixing matrices from engine output");
        (mixing, unmixing)
    };

    Ok(sort_by_channel(LoadedRun {
        mixing,
        unmixing,
        enabled_channels,
    }))
}

/// Reorder a run so that matrix index `k` belongs to the `k`-th smallest hinted
/// channel. Channels index unmixing columns and mixing rows; components keep
/// their order, so a saved selection still refers to the same sources.
fn sort_by_channel(run: LoadedRun) -> LoadedRun {
    let mut order: Vec<usize> = (0..run.enabled_channels.len()).collect();
    order.sort_by_key(|&k| run.enabled_channels[k]);
    if order.iter().enumerate().all(|(i, &k)| i == k) {
        return run;
    }
    debug!(hint = ?run.enabled_channels, "reordering decomposition by channel");
    let n = order.len();
    LoadedRun {
        mixing: DMatrix::from_fn(n, n, |k, c| run.mixing[(order[k], c)]),
        unmixing: DMatrix::from_fn(n, n, |c, k| run.unmixing[(c, order[k])]),
        enabled_channels: order.iter().map(|&k| run.enabled_channels[k]).collect(),
    }
}

/// Run directory name for a run started now.
fn run_dir_name(config: &IcaConfig) -> String {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let suffix = config.sanitized_suffix();
    if suffix.is_empty() {
        format!("ICA_{stamp}")
    } else {
        format!("ICA_{stamp}_{suffix}")
    }
}

/// Create a fresh run directory, adding a counter if the name is taken.
fn create_run_dir(config: &IcaConfig) -> Result<PathBuf, IcaError> {
    let root = &config.output_root;
    std::fs::create_dir_all(root).map_err(io_context("creating ICA output root", root))?;
    let base = run_dir_name(config);
    let mut candidate = root.join(&base);
    let mut attempt = 1;
    loop {
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
                candidate = root.join(format!("{base}-{attempt}"));
            }
            Err(err) => return Err(io_context("creating ICA run directory", &candidate)(err)),
        }
    }
}

/// Publishes events and status lines for one run.
struct Reporter {
    stream: StreamId,
    events: Sender<TrainingEvent>,
    last_status: Arc<Mutex<String>>,
}

impl Reporter {
    fn send(&self, event: TrainingEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            debug!(?event, "training event dropped, no subscriber draining");
        }
    }

    fn status(&self, line: String) {
        push_status(line.clone());
        *self.last_status.lock() = line;
    }

    fn stage(&self, stage: TrainingStage) {
        info!(stream = self.stream, %stage, "training stage");
        self.status(format!("Stream {}: {stage}", self.stream));
        self.send(TrainingEvent::Stage {
            stream: self.stream,
            stage,
        });
    }
}

/// One training run executing on the worker thread.
struct Run<'a> {
    request: TrainingRequest,
    backend: &'a dyn DecompositionBackend,
    cancel: CancelToken,
    reporter: &'a Reporter,
}

impl Run<'_> {
    fn execute(&self) -> Result<PathBuf, IcaError> {
        let (directory, frames) = self.capture_training_data()?;
        match self.decompose(&directory, frames) {
            Ok(()) => Ok(directory),
            Err(err) => {
                if err.is_cancellation() {
                    if let Err(remove) = std::fs::remove_dir_all(&directory) {
                        warn!(?directory, %remove, "failed to remove cancelled run directory");
                    }
                } else {
                    debug!(?directory, "keeping failed run directory");
                }
                Err(err)
            }
        }
    }

    /// Steps 2 and 3: wait for a full cache, then write it out under the lock.
    fn capture_training_data(&self) -> Result<(PathBuf, usize), IcaError> {
        let cache = self.request.state.cache();
        loop {
            self.reporter.stage(TrainingStage::AwaitingData);
            while cache.percent_full() < 100 {
                self.cancel.check()?;
                std::thread::sleep(self.request.config.poll_interval());
            }

            self.reporter.stage(TrainingStage::WritingData);
            let handle = self.lock_cache()?;
            if !handle.is_full() {
                debug!(stream = self.request.stream_id, "cache lost fullness, waiting again");
                continue;
            }
            if let Some(&channel) = self
                .request
                .channels
                .iter()
                .find(|&&c| c >= handle.channels())
            {
                return Err(IcaError::ChannelMismatch(format!(
                    "channel {channel} is no longer part of the stream ({} channels)",
                    handle.channels()
                )));
            }
            let directory = create_run_dir(&self.request.config)?;
            let frames = handle.capacity();
            handle.write_channels_to_file(&directory.join(DATA_FILE), &self.request.channels)?;
            drop(handle);
            self.reporter.status(format!("Training data written to {}", directory.display()));
            return Ok((directory, frames));
        }
    }

    fn lock_cache(&self) -> Result<CacheHandle<'_>, IcaError> {
        let cache = self.request.state.cache();
        loop {
            self.cancel.check()?;
            if let Some(handle) = cache.try_lock() {
                return Ok(handle);
            }
            debug!("cache busy, retrying");
            std::thread::sleep(self.request.config.poll_interval());
        }
    }

    /// Steps 4 to 7.
    fn decompose(&self, directory: &Path, frames: usize) -> Result<(), IcaError> {
        self.cancel.check()?;
        self.reporter.stage(TrainingStage::RunningEngine);
        let config_file = TrainingConfigFile::new(self.request.channels.clone(), frames);
        config_file.write(&directory.join(CONFIG_FILE))?;
        let job = EngineJob::new(directory.to_path_buf(), config_file);
        let output = self.backend.decompose(&job, &self.cancel)?;

        self.cancel.check()?;
        self.reporter.stage(TrainingStage::ComputingMatrices);
        let (mixing, unmixing) = compute_mixing(&output.weights, &output.sphere)?;
        write_matrix(&directory.join(MIXING_FILE), &mixing)?;
        write_matrix(&directory.join(UNMIXING_FILE), &unmixing)?;

        self.cancel.check()?;
        self.reporter.stage(TrainingStage::Installing);
        let state = &self.request.state;
        state.install(
            mixing,
            unmixing,
            self.request.channels.clone(),
            self.request.config.default_rejection,
        )?;
        state.set_decomposition_dir(Some(directory.to_path_buf()));
        Ok(())
    }
}

/// Clears the running flag however the worker exits.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the training worker thread.
pub struct Trainer {
    backend: RwLock<Arc<dyn DecompositionBackend>>,
    cancel: Mutex<CancelToken>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events_tx: Sender<TrainingEvent>,
    events_rx: Receiver<TrainingEvent>,
    last_status: Arc<Mutex<String>>,
}

impl Trainer {
    /// Trainer driving `backend`.
    pub fn new(backend: Arc<dyn DecompositionBackend>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        Self {
            backend: RwLock::new(backend),
            cancel: Mutex::new(CancelToken::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            events_tx,
            events_rx,
            last_status: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> String {
        self.backend.read().name().to_string()
    }

    /// Use `backend` for runs started from now on. An active run keeps the
    /// backend it started with.
    pub fn set_backend(&self, backend: Arc<dyn DecompositionBackend>) {
        info!(backend = backend.name(), "decomposition backend replaced");
        *self.backend.write() = backend;
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Most recent status line.
    pub fn last_status(&self) -> String {
        self.last_status.lock().clone()
    }

    /// Receiver for run events. Receivers share one queue.
    pub fn events(&self) -> Receiver<TrainingEvent> {
        self.events_rx.clone()
    }

    /// Spawn a run. Fails with [`IcaError::AlreadyRunning`] while one is active.
    pub(crate) fn start(&self, request: TrainingRequest) -> Result<(), IcaError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IcaError::AlreadyRunning);
        }
        let guard = RunningGuard(Arc::clone(&self.running));

        let mut worker = self.worker.lock();
        if let Some(finished) = worker.take() {
            if finished.join().is_err() {
                error!("previous training thread panicked");
            }
        }

        let cancel = CancelToken::new();
        *self.cancel.lock() = cancel.clone();
        let backend = Arc::clone(&self.backend.read());
        let reporter = Reporter {
            stream: request.stream_id,
            events: self.events_tx.clone(),
            last_status: Arc::clone(&self.last_status),
        };

        let handle = std::thread::Builder::new()
            .name("ica-training".into())
            .spawn(move || {
                let _guard = guard;
                let stream = reporter.stream;
                info!(stream, backend = backend.name(), channels = ?request.channels, "ICA training started");
                reporter.status(format!("Stream {stream}: ICA training started"));
                reporter.send(TrainingEvent::Started { stream });

                let run = Run {
                    request,
                    backend: backend.as_ref(),
                    cancel,
                    reporter: &reporter,
                };
                match run.execute() {
                    Ok(directory) => {
                        info!(stream, ?directory, "ICA training finished");
                        reporter.status(format!(
                            "Stream {stream}: ICA finished ({})",
                            directory.display()
                        ));
                        reporter.send(TrainingEvent::Finished { stream, directory });
                    }
                    Err(err) if err.is_cancellation() => {
                        info!(stream, "ICA training cancelled");
                        reporter.status(format!("Stream {stream}: ICA cancelled"));
                        reporter.send(TrainingEvent::Cancelled { stream });
                    }
                    Err(err) => {
                        error!(stream, %err, category = ?err.category(), "ICA training failed");
                        let message = err.to_string();
                        reporter.status(format!("Stream {stream}: ICA failed: {message}"));
                        reporter.send(TrainingEvent::Failed { stream, message });
                    }
                }
            })
            .map_err(io_context("spawning training thread", Path::new("ica-training")))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Ask the active run, if any, to stop.
    pub fn cancel(&self) {
        if self.is_running() {
            warn!("cancelling ICA training");
        }
        self.cancel.lock().cancel();
    }

    /// Block until the current worker thread has exited.
    pub fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("training thread panicked");
            }
        }
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}
