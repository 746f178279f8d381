//! Control layer exposing the registered processor to external tooling.

/// High-level control API over the registered processor.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
