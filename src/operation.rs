//! Decomposition snapshots and the per-stream lock that publishes them.
//!
//! A [`Decomposition`] is immutable once installed: every edit builds a new
//! snapshot and swaps it in under the write lock, so the real-time reader
//! (which only ever uses `try_read`) never sees a half-updated matrix pair.
use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::DMatrix;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::error::IcaError;

/// Which component a freshly trained decomposition rejects when there is no
/// prior selection to inherit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultRejection {
    /// Reject component 0, which usually carries the largest shared signal.
    #[default]
    FirstComponent,
    /// Keep everything.
    None,
}

impl DefaultRejection {
    /// Rejected set for a decomposition of `dimension` components.
    pub fn rejected_set(self, dimension: usize) -> BTreeSet<usize> {
        match self {
            DefaultRejection::FirstComponent if dimension > 0 => BTreeSet::from([0]),
            _ => BTreeSet::new(),
        }
    }
}

fn check_fits(op: &Decomposition, channel_count: usize) -> Result<(), IcaError> {
    match op.max_channel() {
        Some(channel) if channel >= channel_count => Err(IcaError::ChannelMismatch(format!(
            "decomposition uses channel {channel} but the stream has {channel_count} channels"
        ))),
        _ => Ok(()),
    }
}

/// Mixing/unmixing pair for one set of enabled channels.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    mixing: DMatrix<f32>,
    unmixing: DMatrix<f32>,
    enabled_channels: Vec<usize>,
    rejected_components: BTreeSet<usize>,
}

impl Decomposition {
    /// Sentinel that applies no transform.
    pub fn noop() -> Self {
        Self {
            mixing: DMatrix::zeros(0, 0),
            unmixing: DMatrix::zeros(0, 0),
            enabled_channels: Vec::new(),
            rejected_components: BTreeSet::new(),
        }
    }

    /// Validate and build a trained decomposition.
    ///
    /// `enabled_channels` must be strictly ascending, with matrix row/column `k`
    /// belonging to `enabled_channels[k]`; its length must equal the dimension
    /// of both square matrices.
    pub fn new(
        mixing: DMatrix<f32>,
        unmixing: DMatrix<f32>,
        enabled_channels: Vec<usize>,
        rejected_components: BTreeSet<usize>,
    ) -> Result<Self, IcaError> {
        if enabled_channels.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(IcaError::ChannelMismatch(format!(
                "enabled channels {enabled_channels:?} are not strictly ascending"
            )));
        }
        let dimension = enabled_channels.len();
        if !mixing.is_square() || !unmixing.is_square() {
            return Err(IcaError::ChannelMismatch(format!(
                "matrices must be square (mixing {}x{}, unmixing {}x{})",
                mixing.nrows(),
                mixing.ncols(),
                unmixing.nrows(),
                unmixing.ncols()
            )));
        }
        if mixing.nrows() != dimension || unmixing.nrows() != dimension {
            return Err(IcaError::ChannelMismatch(format!(
                "{} enabled channels but matrix dimension is {}",
                dimension,
                mixing.nrows()
            )));
        }
        if let Some(&component) = rejected_components.iter().find(|&&c| c >= dimension) {
            return Err(IcaError::InvalidComponent {
                component,
                dimension,
            });
        }
        Ok(Self {
            mixing,
            unmixing,
            enabled_channels,
            rejected_components,
        })
    }

    /// Whether this is the no-op sentinel.
    pub fn is_noop(&self) -> bool {
        self.enabled_channels.is_empty()
    }

    /// Number of components (== enabled channel count).
    pub fn dimension(&self) -> usize {
        self.enabled_channels.len()
    }

    /// Mixing matrix, channels x components.
    pub fn mixing(&self) -> &DMatrix<f32> {
        &self.mixing
    }

    /// Unmixing matrix, components x channels.
    pub fn unmixing(&self) -> &DMatrix<f32> {
        &self.unmixing
    }

    /// Sorted stream-relative channel indices the matrices act on.
    pub fn enabled_channels(&self) -> &[usize] {
        &self.enabled_channels
    }

    /// Rejected component indices.
    pub fn rejected_components(&self) -> &BTreeSet<usize> {
        &self.rejected_components
    }

    /// Kept component indices (complement of the rejected set).
    pub fn kept_components(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.dimension()).filter(|c| !self.rejected_components.contains(c))
    }

    /// Largest stream-relative channel index this decomposition touches.
    pub fn max_channel(&self) -> Option<usize> {
        self.enabled_channels.last().copied()
    }

    /// Euclidean norm of each mixing-matrix column (one per component).
    pub fn component_norms(&self) -> Vec<f32> {
        self.mixing.column_iter().map(|col| col.norm()).collect()
    }

    /// Replace the rejected set, validating indices.
    pub fn set_rejected(&mut self, rejected: BTreeSet<usize>) -> Result<(), IcaError> {
        let dimension = self.dimension();
        if let Some(&component) = rejected.iter().find(|&&c| c >= dimension) {
            return Err(IcaError::InvalidComponent {
                component,
                dimension,
            });
        }
        self.rejected_components = rejected;
        Ok(())
    }

    /// Mark one component kept or rejected.
    pub fn set_component_kept(&mut self, component: usize, keep: bool) -> Result<(), IcaError> {
        if component >= self.dimension() {
            return Err(IcaError::InvalidComponent {
                component,
                dimension: self.dimension(),
            });
        }
        if keep {
            self.rejected_components.remove(&component);
        } else {
            self.rejected_components.insert(component);
        }
        Ok(())
    }

    /// Flip every component's selection.
    pub fn invert_selection(&mut self) {
        self.rejected_components = self.kept_components().collect();
    }
}

/// Per-stream slot holding the current decomposition snapshot.
pub struct SharedOperation {
    current: RwLock<Arc<Decomposition>>,
}

impl Default for SharedOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedOperation {
    /// Start with the no-op sentinel.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Decomposition::noop())),
        }
    }

    /// Non-blocking read for the real-time path. `None` means "skip this block".
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Arc<Decomposition>>> {
        self.current.try_read()
    }

    /// Blocking snapshot for display and persistence.
    pub fn snapshot(&self) -> Arc<Decomposition> {
        Arc::clone(&self.current.read())
    }

    /// Install a freshly trained or loaded decomposition.
    ///
    /// The rejected set is inherited from the previous snapshot when both act on
    /// the same enabled channels, otherwise `default_rejection` applies.
    pub fn install(
        &self,
        mixing: DMatrix<f32>,
        unmixing: DMatrix<f32>,
        enabled_channels: Vec<usize>,
        default_rejection: DefaultRejection,
    ) -> Result<Arc<Decomposition>, IcaError> {
        self.install_fitting(mixing, unmixing, enabled_channels, default_rejection, || {
            usize::MAX
        })
    }

    /// [`install`](Self::install) for a stream whose channel count is read by
    /// `channel_count` while the write lock is held. A decomposition reaching
    /// past that count is refused and the current snapshot stays.
    pub fn install_fitting<F>(
        &self,
        mixing: DMatrix<f32>,
        unmixing: DMatrix<f32>,
        enabled_channels: Vec<usize>,
        default_rejection: DefaultRejection,
        channel_count: F,
    ) -> Result<Arc<Decomposition>, IcaError>
    where
        F: FnOnce() -> usize,
    {
        let mut next = Decomposition::new(mixing, unmixing, enabled_channels, BTreeSet::new())?;
        let mut guard = self.current.write();
        check_fits(&next, channel_count())?;
        let rejected = if !guard.is_noop() && guard.enabled_channels == next.enabled_channels {
            guard.rejected_components.clone()
        } else {
            default_rejection.rejected_set(next.dimension())
        };
        next.set_rejected(rejected)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(next)
    }

    /// Swap in an already validated snapshot as-is.
    pub fn replace(&self, next: Decomposition) {
        *self.current.write() = Arc::new(next);
    }

    /// [`replace`](Self::replace), refusing a snapshot that reaches past the
    /// channel count read under the write lock.
    pub fn replace_fitting<F>(&self, next: Decomposition, channel_count: F) -> Result<(), IcaError>
    where
        F: FnOnce() -> usize,
    {
        let mut guard = self.current.write();
        check_fits(&next, channel_count())?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Reset to the no-op sentinel, waiting for readers.
    pub fn reset(&self) {
        *self.current.write() = Arc::new(Decomposition::noop());
    }

    /// Reset to the no-op sentinel only if the lock is free. Returns whether it happened.
    pub fn try_reset(&self) -> bool {
        match self.current.try_write() {
            Some(mut guard) => {
                *guard = Arc::new(Decomposition::noop());
                true
            }
            None => false,
        }
    }

    /// Apply an edit to the current snapshot under the blocking write lock.
    ///
    /// The edit runs on a private copy when the snapshot is shared, so readers
    /// holding the old `Arc` keep seeing it unchanged.
    pub fn edit<F>(&self, edit: F) -> Result<Arc<Decomposition>, IcaError>
    where
        F: FnOnce(&mut Decomposition) -> Result<(), IcaError>,
    {
        let mut guard = self.current.write();
        if guard.is_noop() {
            return Err(IcaError::InvalidComponent {
                component: 0,
                dimension: 0,
            });
        }
        let mut next = (**guard).clone();
        edit(&mut next)?;
        *guard = Arc::new(next);
        Ok(Arc::clone(&guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: usize) -> DMatrix<f32> {
        DMatrix::identity(n, n)
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let err = Decomposition::new(identity(3), identity(3), vec![0, 1], BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, IcaError::ChannelMismatch(_)));

        let err = Decomposition::new(identity(2), identity(2), vec![0, 1], BTreeSet::from([2]))
            .unwrap_err();
        assert!(matches!(
            err,
            IcaError::InvalidComponent {
                component: 2,
                dimension: 2
            }
        ));
    }

    #[test]
    fn first_install_rejects_component_zero() {
        let op = SharedOperation::new();
        assert!(op.snapshot().is_noop());
        let installed = op
            .install(identity(3), identity(3), vec![0, 1, 2], DefaultRejection::FirstComponent)
            .unwrap();
        assert_eq!(installed.enabled_channels(), &[0, 1, 2]);
        assert_eq!(installed.rejected_components(), &BTreeSet::from([0]));
    }

    #[test]
    fn unordered_channels_are_refused_instead_of_reordered() {
        for enabled in [vec![1, 0], vec![0, 0]] {
            let err = Decomposition::new(identity(2), identity(2), enabled, BTreeSet::new())
                .unwrap_err();
            assert!(matches!(err, IcaError::ChannelMismatch(_)));
        }
        let op = SharedOperation::new();
        assert!(
            op.install(identity(2), identity(2), vec![3, 1], DefaultRejection::None)
                .is_err()
        );
        assert!(op.snapshot().is_noop());
    }

    #[test]
    fn reinstall_on_same_channels_inherits_selection() {
        let op = SharedOperation::new();
        op.install(identity(3), identity(3), vec![0, 1, 2], DefaultRejection::FirstComponent)
            .unwrap();
        op.edit(|d| d.set_rejected(BTreeSet::from([1, 2]))).unwrap();

        let same = op
            .install(identity(3), identity(3), vec![0, 1, 2], DefaultRejection::FirstComponent)
            .unwrap();
        assert_eq!(same.rejected_components(), &BTreeSet::from([1, 2]));

        let other = op
            .install(identity(3), identity(3), vec![0, 1, 3], DefaultRejection::FirstComponent)
            .unwrap();
        assert_eq!(other.rejected_components(), &BTreeSet::from([0]));
    }

    #[test]
    fn edits_do_not_mutate_outstanding_snapshots() {
        let op = SharedOperation::new();
        op.install(identity(2), identity(2), vec![0, 1], DefaultRejection::None)
            .unwrap();
        let before = op.snapshot();
        op.edit(|d| d.set_component_kept(1, false)).unwrap();
        assert!(before.rejected_components().is_empty());
        assert_eq!(op.snapshot().rejected_components(), &BTreeSet::from([1]));
    }

    #[test]
    fn edit_validates_component_range() {
        let op = SharedOperation::new();
        assert!(op.edit(|d| d.set_component_kept(0, true)).is_err());
        op.install(identity(2), identity(2), vec![0, 1], DefaultRejection::None)
            .unwrap();
        let err = op.edit(|d| d.set_component_kept(5, false)).unwrap_err();
        assert!(matches!(err, IcaError::InvalidComponent { component: 5, .. }));
    }

    #[test]
    fn invert_selection_swaps_kept_and_rejected() {
        let mut d = Decomposition::new(identity(4), identity(4), vec![0, 1, 2, 3], BTreeSet::from([0, 2]))
            .unwrap();
        d.invert_selection();
        assert_eq!(d.rejected_components(), &BTreeSet::from([1, 3]));
        assert_eq!(d.kept_components().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn fitting_installs_refuse_channels_past_the_count() {
        let op = SharedOperation::new();
        op.install(identity(2), identity(2), vec![0, 1], DefaultRejection::None)
            .unwrap();
        let err = op
            .install_fitting(identity(2), identity(2), vec![0, 3], DefaultRejection::None, || 3)
            .unwrap_err();
        assert!(matches!(err, IcaError::ChannelMismatch(_)));
        assert_eq!(op.snapshot().enabled_channels(), &[0, 1]);

        let wide = Decomposition::new(identity(2), identity(2), vec![1, 2], BTreeSet::new()).unwrap();
        assert!(op.replace_fitting(wide.clone(), || 2).is_err());
        op.replace_fitting(wide, || 3).unwrap();
        assert_eq!(op.snapshot().enabled_channels(), &[1, 2]);
    }

    #[test]
    fn try_reset_fails_fast_under_reader() {
        let op = SharedOperation::new();
        op.install(identity(2), identity(2), vec![0, 1], DefaultRejection::None)
            .unwrap();
        let reader = op.try_read().unwrap();
        assert!(!op.try_reset());
        drop(reader);
        assert!(op.try_reset());
        assert!(op.snapshot().is_noop());
    }

    #[test]
    fn component_norms_follow_mixing_columns() {
        let mixing = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, 4.0, 2.0]);
        let d = Decomposition::new(mixing, identity(2), vec![0, 1], BTreeSet::new()).unwrap();
        let norms = d.component_norms();
        assert!((norms[0] - 5.0).abs() < 1e-6);
        assert!((norms[1] - 2.0).abs() < 1e-6);
    }
}
