#![deny(missing_docs)]

//! Streaming independent component analysis for multichannel sample streams.
//!
//! An [`IcaProcessor`] keeps, per logical input stream, a ring buffer of
//! downsampled training data ([`cache::SampleCache`]) and the currently
//! installed decomposition ([`operation::SharedOperation`]). A background
//! thread ([`training::Trainer`]) waits for a full cache, hands the data to a
//! [`backend::DecompositionBackend`] and swaps the resulting mixing/unmixing
//! pair in. The real-time path ([`IcaProcessor::process`]) only ever uses
//! non-blocking lock attempts and rewrites each block in place, dropping the
//! rejected components.

use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

pub mod apply;
pub mod backend;
pub mod block;
pub mod cache;
pub mod config;
/// Developer-facing control and TUI support.
pub mod control;
pub mod error;
pub mod operation;
pub mod persist;
pub mod processor;
pub mod registry;
pub mod training;

#[cfg(test)]
mod tests;

pub use block::{ChannelBuffer, PlanarBuffer, RawChannels};
pub use config::IcaConfig;
pub use error::{ErrorCategory, IcaError};
pub use operation::{Decomposition, DefaultRejection};
pub use processor::{ActiveChannelProvider, AllChannelsActive, IcaProcessor, StreamStatus};
pub use registry::{InputChannel, StreamId, StreamInfo};
pub use training::{CancelToken, TrainingEvent, TrainingStage};

/// Status lines kept for `ica_pop_status` before the oldest are dropped.
const STATUS_CAPACITY: usize = 256;

static STATUS_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static STATUS_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));
static TRACING_INIT: Once = Once::new();
static PROCESSOR_GLOBAL: Lazy<RwLock<Option<Arc<IcaProcessor>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide `tracing` subscriber (stderr) once.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Append a human-readable status line to the bounded status log.
pub fn push_status(line: impl Into<String>) {
    let mut guard = STATUS_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > STATUS_CAPACITY {
        guard.pop_front();
    }
}

/// Remove and return the oldest status line.
pub fn pop_status() -> Option<String> {
    STATUS_BUFFER.lock().pop_front()
}

/// Make `processor` the one the control API and console talk to.
pub fn register_processor(processor: Arc<IcaProcessor>) {
    *PROCESSOR_GLOBAL.write() = Some(processor);
}

/// Forget the registered processor if it is `processor`.
pub fn unregister_processor(processor: &Arc<IcaProcessor>) {
    let mut global = PROCESSOR_GLOBAL.write();
    if global.as_ref().is_some_and(|p| Arc::ptr_eq(p, processor)) {
        *global = None;
    }
}

/// The registered processor, if any.
pub fn global_processor() -> Option<Arc<IcaProcessor>> {
    PROCESSOR_GLOBAL.read().clone()
}

/// Borrow a processor behind an FFI handle.
///
/// # Safety
/// `handle` must be null or a live pointer returned by [`ica_processor_create`].
unsafe fn processor_ref<'a>(handle: *const IcaProcessor) -> Option<&'a IcaProcessor> {
    if handle.is_null() {
        None
    } else {
        Some(unsafe { &*handle })
    }
}

/// Create a processor and register it globally.
///
/// `config_path` may be null (environment defaults) or a JSON settings file.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_create(config_path: *const c_char) -> *const IcaProcessor {
    init_tracing();
    let config = if config_path.is_null() {
        IcaConfig::from_env()
    } else {
        let path = unsafe { CStr::from_ptr(config_path) }.to_string_lossy();
        config::load_config::<IcaConfig>(&PathBuf::from(path.as_ref()))
    };
    let processor = Arc::new(IcaProcessor::new(config));
    register_processor(Arc::clone(&processor));
    push_status("ICA processor created");
    Arc::into_raw(processor)
}

/// Destroy a processor, cancelling any training run.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_destroy(handle: *const IcaProcessor) {
    if handle.is_null() {
        return;
    }
    let processor = unsafe { Arc::from_raw(handle) };
    unregister_processor(&processor);
    processor.cancel_training();
    drop(processor);
}

/// Describe the host's channel layout.
///
/// Block channel `i` belongs to stream `stream_ids[i]`, sampled at
/// `sample_rates[i]`. Returns `false` on null input.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_update_streams(
    handle: *const IcaProcessor,
    stream_ids: *const u32,
    sample_rates: *const f32,
    channel_count: u32,
) -> bool {
    let Some(processor) = (unsafe { processor_ref(handle) }) else {
        return false;
    };
    if channel_count > 0 && (stream_ids.is_null() || sample_rates.is_null()) {
        return false;
    }
    let count = channel_count as usize;
    let (ids, rates) = if count == 0 {
        (&[][..], &[][..])
    } else {
        unsafe {
            (
                slice::from_raw_parts(stream_ids, count),
                slice::from_raw_parts(sample_rates, count),
            )
        }
    };
    let mut per_stream = std::collections::BTreeMap::<u32, usize>::new();
    let channels: Vec<InputChannel> = ids
        .iter()
        .zip(rates)
        .enumerate()
        .map(|(global_index, (&stream_id, &sample_rate))| {
            let position = per_stream.entry(stream_id).or_insert(0);
            *position += 1;
            InputChannel {
                global_index,
                stream_id,
                stream_name: format!("Stream {stream_id}"),
                name: format!("CH{position}"),
                sample_rate,
            }
        })
        .collect();
    processor.update_streams(&channels);
    true
}

/// Real-time block processing over `channel_count` host channel pointers of
/// `frames` samples each.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_process(
    handle: *const IcaProcessor,
    channels: *const *mut f32,
    channel_count: u32,
    frames: u32,
) {
    let Some(processor) = (unsafe { processor_ref(handle) }) else {
        return;
    };
    if channels.is_null() || channel_count == 0 {
        return;
    }
    let pointers = unsafe { slice::from_raw_parts(channels, channel_count as usize) };
    if pointers.iter().any(|p| p.is_null()) {
        return;
    }
    let mut block = unsafe { RawChannels::new(pointers, frames as usize) };
    processor.process(&mut block);
}

/// Cache fill level of `stream` in percent, or -1 for an unknown stream.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_percent_full(
    handle: *const IcaProcessor,
    stream: u32,
) -> i32 {
    unsafe { processor_ref(handle) }
        .and_then(|p| p.percent_full(stream).ok())
        .map_or(-1, i32::from)
}

/// Start training on `stream`. Failures are reported on the status log.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_start_training(
    handle: *const IcaProcessor,
    stream: u32,
) -> bool {
    let Some(processor) = (unsafe { processor_ref(handle) }) else {
        return false;
    };
    match processor.start_training(stream) {
        Ok(()) => true,
        Err(err) => {
            warn!(stream, %err, "start_training rejected");
            push_status(format!("Stream {stream}: {err}"));
            false
        }
    }
}

/// Cancel the active training run.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_cancel_training(handle: *const IcaProcessor) {
    if let Some(processor) = unsafe { processor_ref(handle) } {
        processor.cancel_training();
    }
}

/// Reset `stream` to the no-op decomposition.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_reset_operation(
    handle: *const IcaProcessor,
    stream: u32,
) -> bool {
    let Some(processor) = (unsafe { processor_ref(handle) }) else {
        return false;
    };
    match processor.reset_operation(stream) {
        Ok(()) => {
            push_status(format!("Stream {stream}: decomposition reset"));
            true
        }
        Err(err) => {
            debug!(stream, %err, "reset_operation failed");
            false
        }
    }
}

/// Whether a training run is active.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ica_processor_is_training(handle: *const IcaProcessor) -> bool {
    unsafe { processor_ref(handle) }.is_some_and(|p| p.is_training())
}

/// Pop the next status line. Returns `NULL` when none remain. The pointer is
/// valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn ica_pop_status() -> *const c_char {
    if let Some(message) = pop_status() {
        let mut cache = STATUS_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
