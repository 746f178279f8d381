//! The processor facade: one object the host, the console and the C ABI share.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{BinicaBackend, DecompositionBackend};
use crate::block::ChannelBuffer;
use crate::config::{IcaConfig, validate_training_duration};
use crate::error::IcaError;
use crate::operation::Decomposition;
use crate::persist::{PersistedOperation, PersistedStream, ProcessorSettings};
use crate::registry::{InputChannel, StreamId, StreamInfo, StreamRegistry, StreamState};
use crate::training::{Trainer, TrainingEvent, TrainingRequest, load_run};
use crate::{init_tracing, push_status};

/// Tells the processor which of a stream's channels the user has switched on.
pub trait ActiveChannelProvider: Send + Sync {
    /// Active stream-relative channel indices of `stream`.
    fn active_channels(&self, stream: &StreamInfo) -> Vec<usize>;
}

/// Every channel of every stream is active.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllChannelsActive;

impl ActiveChannelProvider for AllChannelsActive {
    fn active_channels(&self, stream: &StreamInfo) -> Vec<usize> {
        (0..stream.channel_count()).collect()
    }
}

fn engine_backend(config: &IcaConfig) -> Arc<dyn DecompositionBackend> {
    Arc::new(BinicaBackend::new(
        config.resolved_engine_path(),
        config.poll_interval(),
    ))
}

/// Display snapshot of one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamStatus {
    /// Stream identifier.
    pub id: StreamId,
    /// Display name.
    pub name: String,
    /// Channel count.
    pub channels: usize,
    /// Training cache fill level.
    pub percent_full: u8,
    /// Components in the installed decomposition, 0 for no-op.
    pub dimension: usize,
    /// Channels the decomposition acts on.
    pub enabled_channels: Vec<usize>,
    /// Rejected components.
    pub rejected_components: Vec<usize>,
    /// Run directory of the installed decomposition.
    pub decomposition_dir: Option<PathBuf>,
    /// Whether this is the selected stream.
    pub is_current: bool,
}

/// Streaming ICA processor.
pub struct IcaProcessor {
    config: RwLock<IcaConfig>,
    registry: StreamRegistry,
    trainer: Trainer,
    active: Box<dyn ActiveChannelProvider>,
    engine_from_config: bool,
}

impl IcaProcessor {
    /// Processor running the external engine named by `config`.
    ///
    /// Restoring settings with a different engine path or poll interval
    /// rebuilds the engine backend.
    pub fn new(config: IcaConfig) -> Self {
        let backend = engine_backend(&config);
        let mut processor = Self::with_backend(config, backend);
        processor.engine_from_config = true;
        processor
    }

    /// Processor using a specific decomposition backend.
    pub fn with_backend(config: IcaConfig, backend: Arc<dyn DecompositionBackend>) -> Self {
        init_tracing();
        let config = config.repaired();
        info!(backend = backend.name(), output_root = ?config.output_root, "ICA processor created");
        Self {
            config: RwLock::new(config),
            registry: StreamRegistry::new(),
            trainer: Trainer::new(backend),
            active: Box::new(AllChannelsActive),
            engine_from_config: false,
        }
    }

    /// Replace the active-channel source.
    pub fn with_active_channels(mut self, provider: impl ActiveChannelProvider + 'static) -> Self {
        self.active = Box::new(provider);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> IcaConfig {
        self.config.read().clone()
    }

    /// Change the training duration, resizing every cache in place.
    pub fn set_training_duration(&self, seconds: f32) -> Result<(), IcaError> {
        let seconds = validate_training_duration(seconds)?;
        let config = {
            let mut config = self.config.write();
            config.training_duration_secs = seconds;
            config.clone()
        };
        self.registry.apply_config(&config);
        info!(seconds, "training duration changed");
        Ok(())
    }

    /// Replace the channel topology.
    pub fn update_streams(&self, channels: &[InputChannel]) {
        let config = self.config();
        self.registry.update_streams(channels, &config);
    }

    /// Layout snapshots of every stream.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.registry.streams()
    }

    /// Stream selected for display.
    pub fn current_stream(&self) -> Option<StreamId> {
        self.registry.current_stream()
    }

    /// Select the stream shown in the interactive view.
    pub fn set_current_stream(&self, stream: StreamId) -> Result<(), IcaError> {
        self.registry.set_current_stream(stream)
    }

    /// Real-time entry point. Never blocks and never allocates.
    pub fn process<B>(&self, block: &mut B)
    where
        B: ChannelBuffer + ?Sized,
    {
        self.registry.process_block(block);
    }

    /// Cache fill level of a stream.
    pub fn percent_full(&self, stream: StreamId) -> Result<u8, IcaError> {
        Ok(self.registry.get(stream)?.cache().percent_full())
    }

    /// Start training on the stream's active channels.
    pub fn start_training(&self, stream: StreamId) -> Result<(), IcaError> {
        let state = self.registry.get(stream)?;
        let info = state.info();
        let channels = self.active.active_channels(&info);
        self.start_training_on(stream, state, channels)
    }

    /// Start training on an explicit set of stream-relative channels.
    pub fn start_training_with_channels(
        &self,
        stream: StreamId,
        channels: &[usize],
    ) -> Result<(), IcaError> {
        let state = self.registry.get(stream)?;
        self.start_training_on(stream, state, channels.to_vec())
    }

    fn start_training_on(
        &self,
        stream: StreamId,
        state: Arc<StreamState>,
        requested: Vec<usize>,
    ) -> Result<(), IcaError> {
        let count = state.info().channel_count();
        let channels: Vec<usize> = requested
            .into_iter()
            .filter(|&c| c < count)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if channels.len() < 2 {
            return Err(IcaError::TooFewChannels(channels.len()));
        }
        self.trainer.start(TrainingRequest {
            stream_id: stream,
            state,
            channels,
            config: self.config(),
        })
    }

    /// Cancel the active run, if any.
    pub fn cancel_training(&self) {
        self.trainer.cancel();
    }

    /// Whether a run is active.
    pub fn is_training(&self) -> bool {
        self.trainer.is_running()
    }

    /// Block until the last started run has ended.
    pub fn wait_for_training(&self) {
        self.trainer.wait();
    }

    /// Training progress events.
    pub fn events(&self) -> Receiver<TrainingEvent> {
        self.trainer.events()
    }

    /// Most recent training status line.
    pub fn last_status(&self) -> String {
        self.trainer.last_status()
    }

    /// Name of the decomposition backend.
    pub fn backend_name(&self) -> String {
        self.trainer.backend_name()
    }

    /// Current decomposition snapshot of a stream.
    pub fn decomposition(&self, stream: StreamId) -> Result<Arc<Decomposition>, IcaError> {
        Ok(self.registry.get(stream)?.operation().snapshot())
    }

    /// Run directory the stream's decomposition came from.
    pub fn decomposition_dir(&self, stream: StreamId) -> Result<Option<PathBuf>, IcaError> {
        Ok(self.registry.get(stream)?.decomposition_dir())
    }

    /// Reset a stream to the no-op decomposition, waiting for readers.
    pub fn reset_operation(&self, stream: StreamId) -> Result<(), IcaError> {
        let state = self.registry.get(stream)?;
        state.operation().reset();
        state.set_decomposition_dir(None);
        info!(stream, "decomposition reset");
        Ok(())
    }

    /// Reset only if nobody holds the decomposition lock. Returns whether it happened.
    pub fn try_reset_operation(&self, stream: StreamId) -> Result<bool, IcaError> {
        let state = self.registry.get(stream)?;
        let reset = state.operation().try_reset();
        if reset {
            state.set_decomposition_dir(None);
        }
        Ok(reset)
    }

    fn edit<F>(&self, stream: StreamId, edit: F) -> Result<Arc<Decomposition>, IcaError>
    where
        F: FnOnce(&mut Decomposition) -> Result<(), IcaError>,
    {
        self.registry.get(stream)?.operation().edit(edit)
    }

    /// Keep or reject one component.
    pub fn set_component_kept(
        &self,
        stream: StreamId,
        component: usize,
        keep: bool,
    ) -> Result<Arc<Decomposition>, IcaError> {
        self.edit(stream, |op| op.set_component_kept(component, keep))
    }

    /// Keep every component.
    pub fn keep_all_components(&self, stream: StreamId) -> Result<Arc<Decomposition>, IcaError> {
        self.edit(stream, |op| op.set_rejected(BTreeSet::new()))
    }

    /// Reject every component.
    pub fn reject_all_components(&self, stream: StreamId) -> Result<Arc<Decomposition>, IcaError> {
        self.edit(stream, |op| {
            let all = (0..op.dimension()).collect();
            op.set_rejected(all)
        })
    }

    /// Flip every component's selection.
    pub fn invert_component_selection(
        &self,
        stream: StreamId,
    ) -> Result<Arc<Decomposition>, IcaError> {
        self.edit(stream, |op| {
            op.invert_selection();
            Ok(())
        })
    }

    /// Replace the rejected set.
    pub fn set_rejected_components(
        &self,
        stream: StreamId,
        rejected: BTreeSet<usize>,
    ) -> Result<Arc<Decomposition>, IcaError> {
        self.edit(stream, |op| op.set_rejected(rejected))
    }

    /// Mixing-matrix column norms of the stream's decomposition.
    pub fn component_norms(&self, stream: StreamId) -> Result<Vec<f32>, IcaError> {
        Ok(self.decomposition(stream)?.component_norms())
    }

    /// Install the decomposition saved alongside `config_file` (a run's
    /// `binica.sc`).
    pub fn load_decomposition(
        &self,
        stream: StreamId,
        config_file: &Path,
    ) -> Result<Arc<Decomposition>, IcaError> {
        let state = self.registry.get(stream)?;
        let count = state.info().channel_count();
        let run = load_run(config_file)?;
        if let Some(&channel) = run.enabled_channels.iter().find(|&&c| c >= count) {
            return Err(IcaError::ChannelMismatch(format!(
                "decomposition uses channel {channel} but stream {stream} has {count} channels"
            )));
        }
        let op = state.install(
            run.mixing,
            run.unmixing,
            run.enabled_channels,
            self.config.read().default_rejection,
        )?;
        let directory = config_file.parent().map(Path::to_path_buf);
        state.set_decomposition_dir(directory);
        info!(stream, ?config_file, dimension = op.dimension(), "decomposition loaded");
        push_status(format!("Stream {stream}: loaded {}", config_file.display()));
        Ok(op)
    }

    /// Capture config, selection and every stream's decomposition.
    pub fn save_settings(&self) -> ProcessorSettings {
        let streams = self
            .registry
            .states()
            .into_iter()
            .map(|(id, state)| {
                let op = state.operation().snapshot();
                PersistedStream {
                    stream_id: id,
                    stream_name: state.info().name,
                    decomposition_dir: state.decomposition_dir(),
                    operation: (!op.is_noop()).then(|| PersistedOperation::encode(&op)),
                }
            })
            .collect();
        ProcessorSettings {
            config: self.config(),
            current_stream: self.current_stream(),
            streams,
        }
    }

    /// Apply saved settings to the streams that currently exist.
    ///
    /// Streams that are missing or whose saved decomposition does not fit are
    /// skipped with a warning. Returns how many decompositions were installed.
    pub fn restore_settings(&self, settings: &ProcessorSettings) -> usize {
        if let Err(err) = settings.config.validate() {
            warn!(%err, "saved settings repaired");
            push_status(format!("Settings: {err}"));
        }
        let config = settings.config.clone().repaired();
        let previous = std::mem::replace(&mut *self.config.write(), config.clone());
        if self.engine_from_config
            && (previous.engine_path != config.engine_path
                || previous.poll_interval_ms != config.poll_interval_ms)
        {
            self.trainer.set_backend(engine_backend(&config));
        }
        self.registry.apply_config(&config);
        if let Some(current) = settings.current_stream {
            if let Err(err) = self.registry.set_current_stream(current) {
                warn!(%err, "saved current stream not present");
            }
        }

        let mut restored = 0;
        for saved in &settings.streams {
            let Some(operation) = &saved.operation else {
                continue;
            };
            match self.restore_stream(saved, operation) {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(stream = saved.stream_id, %err, "skipping saved decomposition");
                    push_status(format!("Stream {}: {err}", saved.stream_id));
                }
            }
        }
        restored
    }

    fn restore_stream(
        &self,
        saved: &PersistedStream,
        operation: &PersistedOperation,
    ) -> Result<(), IcaError> {
        let state = self.registry.get(saved.stream_id)?;
        let (mixing, unmixing, enabled, rejected) = operation.decode()?;
        let count = state.info().channel_count();
        if let Some(&channel) = enabled.iter().find(|&&c| c >= count) {
            return Err(IcaError::ChannelMismatch(format!(
                "saved decomposition uses channel {channel} but the stream has {count} channels"
            )));
        }
        let dimension = enabled.len();
        let rejected = rejected.unwrap_or_else(|| {
            warn!(
                stream = saved.stream_id,
                "saved component selection does not fit, using the default"
            );
            self.config.read().default_rejection.rejected_set(dimension)
        });
        let op = Decomposition::new(mixing, unmixing, enabled, rejected)?;
        state.replace(op)?;
        state.set_decomposition_dir(saved.decomposition_dir.clone());
        Ok(())
    }

    /// Display snapshot of every stream.
    pub fn status(&self) -> Vec<StreamStatus> {
        let current = self.current_stream();
        self.registry
            .states()
            .into_iter()
            .map(|(id, state)| {
                let info = state.info();
                let op = state.operation().snapshot();
                StreamStatus {
                    id,
                    name: info.name.clone(),
                    channels: info.channel_count(),
                    percent_full: state.cache().percent_full(),
                    dimension: op.dimension(),
                    enabled_channels: op.enabled_channels().to_vec(),
                    rejected_components: op.rejected_components().iter().copied().collect(),
                    decomposition_dir: state.decomposition_dir(),
                    is_current: current == Some(id),
                }
            })
            .collect()
    }
}

impl Drop for IcaProcessor {
    fn drop(&mut self) {
        if self.trainer.is_running() {
            info!("processor dropped while training, cancelling");
        }
        self.trainer.cancel();
        self.trainer.wait();
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::*;
    use crate::backend::WhiteningBackend;
    use crate::persist::{CONFIG_FILE, MIXING_FILE, TrainingConfigFile, UNMIXING_FILE, write_matrix};

    fn processor(root: &Path) -> IcaProcessor {
        let config = IcaConfig {
            output_root: root.to_path_buf(),
            training_duration_secs: 1.0,
            target_sample_rate: 100.0,
            poll_interval_ms: 1,
            ..IcaConfig::default()
        };
        IcaProcessor::with_backend(config, Arc::new(WhiteningBackend))
    }

    fn layout(stream: StreamId, count: usize) -> Vec<InputChannel> {
        (0..count)
            .map(|i| InputChannel {
                global_index: i,
                stream_id: stream,
                stream_name: "EEG".into(),
                name: format!("CH{}", i + 1),
                sample_rate: 100.0,
            })
            .collect()
    }

    fn write_run(dir: &Path, enabled: Vec<usize>) -> PathBuf {
        let n = enabled.len();
        let config_path = dir.join(CONFIG_FILE);
        TrainingConfigFile::new(enabled, 10).write(&config_path).unwrap();
        let unmixing = DMatrix::from_fn(n, n, |i, j| if i == j { 2.0 } else { 0.0 });
        let mixing = DMatrix::from_fn(n, n, |i, j| if i == j { 0.5 } else { 0.0 });
        write_matrix(&dir.join(MIXING_FILE), &mixing).unwrap();
        write_matrix(&dir.join(UNMIXING_FILE), &unmixing).unwrap();
        config_path
    }

    #[test]
    fn too_few_channels_never_starts_a_run() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 3));
        let err = processor.start_training_with_channels(1, &[2, 2, 9]).unwrap_err();
        assert!(matches!(err, IcaError::TooFewChannels(1)));
        assert!(!processor.is_training());
    }

    #[test]
    fn unknown_streams_are_reported() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        assert!(matches!(processor.start_training(4), Err(IcaError::UnknownStream(4))));
        assert!(matches!(processor.percent_full(4), Err(IcaError::UnknownStream(4))));
    }

    #[test]
    fn edits_on_noop_are_rejected_and_out_of_range_components_too() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 3));
        assert!(processor.keep_all_components(1).is_err());

        let config = write_run(root.path(), vec![0, 2]);
        processor.load_decomposition(1, &config).unwrap();
        assert!(matches!(
            processor.set_component_kept(1, 2, false),
            Err(IcaError::InvalidComponent { component: 2, dimension: 2 })
        ));
    }

    #[test]
    fn selection_edits_replace_the_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 3));
        let config = write_run(root.path(), vec![0, 1, 2]);
        let loaded = processor.load_decomposition(1, &config).unwrap();
        assert_eq!(loaded.rejected_components(), &BTreeSet::from([0]));

        let inverted = processor.invert_component_selection(1).unwrap();
        assert_eq!(inverted.rejected_components(), &BTreeSet::from([1, 2]));
        // The earlier snapshot is untouched.
        assert_eq!(loaded.rejected_components(), &BTreeSet::from([0]));

        let all = processor.reject_all_components(1).unwrap();
        assert_eq!(all.rejected_components().len(), 3);
        let none = processor.keep_all_components(1).unwrap();
        assert!(none.rejected_components().is_empty());
        processor.set_component_kept(1, 1, false).unwrap();
        assert_eq!(
            processor.decomposition(1).unwrap().rejected_components(),
            &BTreeSet::from([1])
        );
        assert_eq!(processor.component_norms(1).unwrap(), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn loading_inherits_selection_for_the_same_channels() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 4));
        let first = tempfile::tempdir().unwrap();
        let config = write_run(first.path(), vec![0, 1, 3]);
        processor.load_decomposition(1, &config).unwrap();
        processor
            .set_rejected_components(1, BTreeSet::from([1, 2]))
            .unwrap();

        let reloaded = processor.load_decomposition(1, &config).unwrap();
        assert_eq!(reloaded.rejected_components(), &BTreeSet::from([1, 2]));

        let second = tempfile::tempdir().unwrap();
        let other = write_run(second.path(), vec![0, 1]);
        let fresh = processor.load_decomposition(1, &other).unwrap();
        assert_eq!(fresh.rejected_components(), &BTreeSet::from([0]));
        assert_eq!(
            processor.decomposition_dir(1).unwrap().as_deref(),
            Some(second.path())
        );
    }

    #[test]
    fn permuted_hint_applies_each_row_to_its_own_channel() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 2));
        let config_path = root.path().join(CONFIG_FILE);
        TrainingConfigFile::new(vec![1, 0], 10).write(&config_path).unwrap();
        let unmixing = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 1.0]);
        let mixing = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, 1.0]);
        write_matrix(&root.path().join(MIXING_FILE), &mixing).unwrap();
        write_matrix(&root.path().join(UNMIXING_FILE), &unmixing).unwrap();

        let op = processor.load_decomposition(1, &config_path).unwrap();
        assert_eq!(op.enabled_channels(), &[0, 1]);
        assert_eq!(op.rejected_components(), &BTreeSet::from([0]));

        // Component 0 is channel 1's source, so rejecting it silences channel 1.
        let mut block = vec![vec![1.0f32; 4], vec![3.0f32; 4]];
        processor.process(&mut block);
        assert_eq!(block[0], vec![1.0; 4]);
        assert_eq!(block[1], vec![0.0; 4]);
    }

    #[test]
    fn loading_rejects_channels_the_stream_lacks() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 2));
        let config = write_run(root.path(), vec![0, 2]);
        assert!(matches!(
            processor.load_decomposition(1, &config),
            Err(IcaError::ChannelMismatch(_))
        ));
        assert!(processor.decomposition(1).unwrap().is_noop());
    }

    #[test]
    fn reset_clears_decomposition_and_dir() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 2));
        let config = write_run(root.path(), vec![0, 1]);
        processor.load_decomposition(1, &config).unwrap();
        assert!(processor.try_reset_operation(1).unwrap());
        assert!(processor.decomposition(1).unwrap().is_noop());
        assert_eq!(processor.decomposition_dir(1).unwrap(), None);
        processor.reset_operation(1).unwrap();
    }

    #[test]
    fn duration_change_resizes_caches() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 2));
        let mut block = vec![vec![1.0f32; 50], vec![2.0f32; 50]];
        processor.process(&mut block);
        assert_eq!(processor.percent_full(1).unwrap(), 50);

        processor.set_training_duration(0.5).unwrap();
        assert_eq!(processor.percent_full(1).unwrap(), 100);
        assert_eq!(processor.config().training_duration_secs, 0.5);
    }

    #[test]
    fn invalid_durations_are_refused_or_repaired() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        processor.update_streams(&layout(1, 2));
        for seconds in [f32::INFINITY, f32::NAN, 0.0, -3.0, 1.0e9] {
            assert!(matches!(
                processor.set_training_duration(seconds),
                Err(IcaError::InvalidConfig(_))
            ));
        }
        assert_eq!(processor.config().training_duration_secs, 1.0);

        let mut settings = processor.save_settings();
        settings.config.training_duration_secs = f32::INFINITY;
        processor.restore_settings(&settings);
        assert_eq!(processor.config().training_duration_secs, 120.0);
        let mut block = vec![vec![1.0f32; 50], vec![2.0f32; 50]];
        processor.process(&mut block);
        assert_eq!(processor.percent_full(1).unwrap(), 0);
    }

    #[test]
    fn restored_engine_path_is_used_by_the_next_run() {
        let root = tempfile::tempdir().unwrap();
        let config = IcaConfig {
            output_root: root.path().to_path_buf(),
            training_duration_secs: 1.0,
            target_sample_rate: 100.0,
            poll_interval_ms: 1,
            engine_path: Some(PathBuf::from("/nonexistent/ica/first-engine")),
            ..IcaConfig::default()
        };
        let processor = IcaProcessor::new(config.clone());
        processor.update_streams(&layout(1, 2));
        let events = processor.events();

        let mut settings = processor.save_settings();
        settings.config.engine_path = Some(PathBuf::from("/nonexistent/ica/second-engine"));
        processor.restore_settings(&settings);
        processor.start_training(1).unwrap();

        let mut frame = 0usize;
        let message = loop {
            assert!(frame < 1_000_000, "run never finished");
            let mut block = vec![
                (0..10).map(|i| ((frame + i) as f32 * 0.3).sin()).collect::<Vec<f32>>(),
                (0..10).map(|i| ((frame + i) % 7) as f32).collect(),
            ];
            processor.process(&mut block);
            frame += 10;
            if let Some(TrainingEvent::Failed { message, .. }) =
                events.try_iter().find(|e| matches!(e, TrainingEvent::Failed { .. }))
            {
                break message;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        processor.wait_for_training();
        assert!(message.contains("second-engine"), "{message}");
    }

    #[test]
    fn status_reports_every_stream() {
        let root = tempfile::tempdir().unwrap();
        let processor = processor(root.path());
        let mut channels = layout(1, 2);
        channels.extend(layout(2, 3).into_iter().map(|mut c| {
            c.global_index += 2;
            c
        }));
        processor.update_streams(&channels);
        let config = write_run(root.path(), vec![0, 2]);
        processor.load_decomposition(2, &config).unwrap();

        let status = processor.status();
        assert_eq!(status.len(), 2);
        assert!(status[0].is_current);
        assert_eq!(status[0].dimension, 0);
        assert_eq!(status[1].channels, 3);
        assert_eq!(status[1].enabled_channels, vec![0, 2]);
        assert_eq!(status[1].rejected_components, vec![0]);
        assert_eq!(status[1].decomposition_dir.as_deref(), Some(root.path()));
    }
}
