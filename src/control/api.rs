use tracing::debug;

use crate::error::IcaError;
use crate::processor::StreamStatus;
use crate::registry::StreamId;
use crate::{global_processor, pop_status, push_status};

/// Snapshot of the registered processor for display.
#[derive(Clone, Debug)]
pub struct ConsoleStatus {
    /// Per-stream state, ordered by id.
    pub streams: Vec<StreamStatus>,
    /// Whether a training run is active.
    pub training: bool,
    /// Most recent training status line.
    pub last_status: String,
    /// Decomposition backend in use.
    pub backend: String,
    /// Training duration in seconds.
    pub training_duration_secs: f32,
    /// Mixing column norms of the current stream's decomposition.
    pub current_norms: Vec<f32>,
}

/// Fetch the current processor status snapshot if a processor is registered.
pub fn get_status() -> Option<ConsoleStatus> {
    let processor = global_processor()?;
    let current_norms = processor
        .current_stream()
        .and_then(|id| processor.component_norms(id).ok())
        .unwrap_or_default();
    Some(ConsoleStatus {
        streams: processor.status(),
        training: processor.is_training(),
        last_status: processor.last_status(),
        backend: processor.backend_name(),
        training_duration_secs: processor.config().training_duration_secs,
        current_norms,
    })
}

/// Drain queued status lines, oldest first.
pub fn drain_messages() -> Vec<String> {
    std::iter::from_fn(pop_status).collect()
}

fn report<T>(stream: StreamId, result: Result<T, IcaError>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            debug!(stream, %err, "control request failed");
            push_status(format!("Stream {stream}: {err}"));
            false
        }
    }
}

/// Select the stream shown in the console.
pub fn select_stream(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.set_current_stream(stream)))
}

/// Start training on `stream`.
pub fn start_training(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.start_training(stream)))
}

/// Cancel the active training run.
pub fn cancel_training() -> bool {
    global_processor().is_some_and(|p| {
        p.cancel_training();
        true
    })
}

/// Reset `stream` to the no-op decomposition.
pub fn reset(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.reset_operation(stream)))
}

/// Flip whether `component` of `stream` is kept.
pub fn toggle_component(stream: StreamId, component: usize) -> bool {
    global_processor().is_some_and(|p| {
        let result = p.decomposition(stream).and_then(|op| {
            let rejected = op.rejected_components().contains(&component);
            p.set_component_kept(stream, component, rejected)
        });
        report(stream, result)
    })
}

/// Keep every component of `stream`.
pub fn keep_all(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.keep_all_components(stream)))
}

/// Reject every component of `stream`.
pub fn reject_all(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.reject_all_components(stream)))
}

/// Invert the component selection of `stream`.
pub fn invert(stream: StreamId) -> bool {
    global_processor().is_some_and(|p| report(stream, p.invert_component_selection(stream)))
}

/// Change the training duration, resizing every cache.
pub fn set_training_duration(seconds: f32) -> bool {
    global_processor().is_some_and(|p| match p.set_training_duration(seconds) {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, "duration change refused");
            push_status(err.to_string());
            false
        }
    })
}
