//! Logical streams and the per-stream state the real-time path touches.
//!
//! Each stream owns its cache, decomposition slot and real-time scratch. The
//! map itself sits behind a read/write lock that the real-time path only ever
//! `try_read`s; topology updates take the write side from the host thread.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use nalgebra::DMatrix;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::apply::TransformApplicator;
use crate::block::ChannelBuffer;
use crate::cache::SampleCache;
use crate::config::IcaConfig;
use crate::error::IcaError;
use crate::operation::{Decomposition, DefaultRejection, SharedOperation};

/// Numeric stream identifier assigned by the host.
pub type StreamId = u32;

/// One input channel as enumerated by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct InputChannel {
    /// Position of the channel in the blocks passed to `process`.
    pub global_index: usize,
    /// Stream the channel belongs to.
    pub stream_id: StreamId,
    /// Display name of that stream.
    pub stream_name: String,
    /// Channel display name.
    pub name: String,
    /// Sample rate of the stream in Hz.
    pub sample_rate: f32,
}

/// Snapshot of a stream's identity and layout.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Stream identifier.
    pub id: StreamId,
    /// Display name.
    pub name: String,
    /// Channel names in stream order.
    pub channel_names: Vec<String>,
    /// Block channel of each stream channel.
    pub global_indices: Vec<usize>,
    /// Sample rate in Hz.
    pub sample_rate: f32,
}

impl StreamInfo {
    /// Number of channels in the stream.
    pub fn channel_count(&self) -> usize {
        self.global_indices.len()
    }
}

/// State only the real-time path uses, behind a `try_lock`.
struct RealtimeState {
    channel_map: Vec<usize>,
    /// Smallest block channel count the map is valid for.
    required_channels: usize,
    downsample_factor: usize,
    /// Offset into the next block of the next sample to cache.
    phase: usize,
    applicator: TransformApplicator,
}

impl RealtimeState {
    fn new(info: &StreamInfo, config: &IcaConfig) -> Self {
        Self {
            channel_map: info.global_indices.clone(),
            required_channels: info.global_indices.iter().max().map_or(0, |&c| c + 1),
            downsample_factor: config.downsample_factor(info.sample_rate),
            phase: 0,
            applicator: TransformApplicator::new(info.channel_count()),
        }
    }
}

/// Offset into the following block of the next sample to keep, after a block
/// of `samples` starting at offset `phase`.
pub(crate) fn next_phase(phase: usize, samples: usize, factor: usize) -> usize {
    let factor = factor.max(1);
    if phase >= samples {
        return phase - samples;
    }
    let taken = (samples - 1 - phase) / factor + 1;
    phase + taken * factor - samples
}

/// Everything the processor keeps for one logical stream.
pub struct StreamState {
    info: RwLock<StreamInfo>,
    cache: SampleCache,
    operation: SharedOperation,
    decomposition_dir: Mutex<Option<PathBuf>>,
    realtime: Mutex<RealtimeState>,
}

impl StreamState {
    fn new(info: StreamInfo, config: &IcaConfig) -> Self {
        let cache = SampleCache::new(info.channel_count(), config.cache_capacity(info.sample_rate));
        let realtime = RealtimeState::new(&info, config);
        Self {
            info: RwLock::new(info),
            cache,
            operation: SharedOperation::new(),
            decomposition_dir: Mutex::new(None),
            realtime: Mutex::new(realtime),
        }
    }

    /// Current layout snapshot.
    pub fn info(&self) -> StreamInfo {
        self.info.read().clone()
    }

    /// Training cache.
    pub fn cache(&self) -> &SampleCache {
        &self.cache
    }

    /// Decomposition slot.
    pub fn operation(&self) -> &SharedOperation {
        &self.operation
    }

    /// Run directory the installed decomposition came from.
    pub fn decomposition_dir(&self) -> Option<PathBuf> {
        self.decomposition_dir.lock().clone()
    }

    /// Record where the installed decomposition came from.
    pub fn set_decomposition_dir(&self, dir: Option<PathBuf>) {
        *self.decomposition_dir.lock() = dir;
    }

    /// Install a decomposition on this stream, refusing one that reaches past
    /// the stream's channel count at the moment of the swap.
    pub fn install(
        &self,
        mixing: DMatrix<f32>,
        unmixing: DMatrix<f32>,
        enabled_channels: Vec<usize>,
        default_rejection: DefaultRejection,
    ) -> Result<Arc<Decomposition>, IcaError> {
        self.operation
            .install_fitting(mixing, unmixing, enabled_channels, default_rejection, || {
                self.info.read().channel_count()
            })
    }

    /// Swap in a complete snapshot under the same channel-count rule as
    /// [`install`](Self::install).
    pub fn replace(&self, next: Decomposition) -> Result<(), IcaError> {
        self.operation
            .replace_fitting(next, || self.info.read().channel_count())
    }

    /// Cache then transform one block. Never blocks: any contended lock skips
    /// that part of the work for this block.
    pub fn process_block<B>(&self, block: &mut B)
    where
        B: ChannelBuffer + ?Sized,
    {
        let Some(mut realtime) = self.realtime.try_lock() else {
            return;
        };
        let realtime = &mut *realtime;
        if realtime.channel_map.is_empty() || realtime.required_channels > block.num_channels() {
            return;
        }

        let samples = block.num_samples();
        let factor = realtime.downsample_factor;
        if let Some(mut cache) = self.cache.try_lock() {
            if cache.channels() == realtime.channel_map.len() {
                let mut index = realtime.phase;
                while index < samples {
                    cache.copy_sample(&*block, &realtime.channel_map, index);
                    index += factor;
                }
            }
        }
        realtime.phase = next_phase(realtime.phase, samples, factor);

        if let Some(op) = self.operation.try_read() {
            realtime
                .applicator
                .apply(&op, block, &realtime.channel_map);
        }
    }

    /// Bring the stream in line with a new layout.
    fn update(&self, info: StreamInfo, config: &IcaConfig) {
        let previous = self.info();
        let count = info.channel_count();
        let capacity = config.cache_capacity(info.sample_rate);

        {
            let mut realtime = self.realtime.lock();
            let mut cache = self.cache.lock();
            if previous.channel_count() != count {
                cache.reset_with_size(count, capacity);
            } else if cache.capacity() != capacity {
                cache.resize_keeping_data(capacity);
            }
            *realtime = RealtimeState::new(&info, config);
        }

        // Publish the new count before checking the decomposition: an install
        // racing with this update either sees the new count or is reset below.
        let id = info.id;
        *self.info.write() = info;
        let op = self.operation.snapshot();
        if op.max_channel().is_some_and(|max| max >= count) {
            self.operation.reset();
            self.set_decomposition_dir(None);
            info!(
                stream = id,
                channels = count,
                "decomposition no longer fits the stream, reset to no-op"
            );
        }
    }

    /// Resize the cache for a new training duration, keeping recent data.
    fn apply_config(&self, config: &IcaConfig) {
        let info = self.info();
        let capacity = config.cache_capacity(info.sample_rate);
        let mut realtime = self.realtime.lock();
        self.cache.lock().resize_keeping_data(capacity);
        realtime.downsample_factor = config.downsample_factor(info.sample_rate);
    }
}

/// All known streams plus the one selected for display.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<BTreeMap<StreamId, Arc<StreamState>>>,
    current: Mutex<Option<StreamId>>,
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the channel topology.
    ///
    /// New streams start with an empty cache and a no-op decomposition. A
    /// stream whose channel count changed has its cache reallocated; a rate
    /// change alone resizes it keeping recent data. Decompositions touching
    /// channels that no longer exist are reset. Streams with no channels left
    /// are removed.
    pub fn update_streams(&self, channels: &[InputChannel], config: &IcaConfig) {
        let mut layouts: BTreeMap<StreamId, StreamInfo> = BTreeMap::new();
        for channel in channels {
            let info = layouts
                .entry(channel.stream_id)
                .or_insert_with(|| StreamInfo {
                    id: channel.stream_id,
                    name: channel.stream_name.clone(),
                    channel_names: Vec::new(),
                    global_indices: Vec::new(),
                    sample_rate: channel.sample_rate,
                });
            info.channel_names.push(channel.name.clone());
            info.global_indices.push(channel.global_index);
        }

        let mut streams = self.streams.write();
        streams.retain(|id, _| {
            let keep = layouts.contains_key(id);
            if !keep {
                info!(stream = id, "stream removed");
            }
            keep
        });
        for (id, info) in layouts {
            match streams.get(&id) {
                Some(state) => {
                    if state.info() != info {
                        debug!(stream = id, channels = info.channel_count(), "stream layout changed");
                        state.update(info, config);
                    }
                }
                None => {
                    info!(stream = id, name = %info.name, channels = info.channel_count(), "stream added");
                    streams.insert(id, Arc::new(StreamState::new(info, config)));
                }
            }
        }

        let mut current = self.current.lock();
        if current.is_none_or(|id| !streams.contains_key(&id)) {
            *current = streams.keys().next().copied();
        }
    }

    /// Look up a stream.
    pub fn get(&self, id: StreamId) -> Result<Arc<StreamState>, IcaError> {
        self.streams
            .read()
            .get(&id)
            .cloned()
            .ok_or(IcaError::UnknownStream(id))
    }

    /// Layout snapshots of every stream, ordered by id.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.streams.read().values().map(|s| s.info()).collect()
    }

    /// Every stream's state, ordered by id.
    pub fn states(&self) -> Vec<(StreamId, Arc<StreamState>)> {
        self.streams
            .read()
            .iter()
            .map(|(id, state)| (*id, Arc::clone(state)))
            .collect()
    }

    /// Stream selected for display.
    pub fn current_stream(&self) -> Option<StreamId> {
        *self.current.lock()
    }

    /// Select the stream shown in the interactive view.
    pub fn set_current_stream(&self, id: StreamId) -> Result<(), IcaError> {
        if !self.streams.read().contains_key(&id) {
            return Err(IcaError::UnknownStream(id));
        }
        *self.current.lock() = Some(id);
        Ok(())
    }

    /// Re-derive cache sizes after a configuration change.
    pub fn apply_config(&self, config: &IcaConfig) {
        for state in self.streams.read().values() {
            state.apply_config(config);
        }
    }

    /// Real-time entry point: process every stream's channels in `block`.
    /// Skips everything if the topology is being updated.
    pub fn process_block<B>(&self, block: &mut B)
    where
        B: ChannelBuffer + ?Sized,
    {
        let Some(streams) = self.streams.try_read() else {
            return;
        };
        for state in streams.values() {
            state.process_block(block);
        }
    }
}
