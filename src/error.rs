//! Error types for layer replacement.

use thiserror::Error;

/// Errors surfaced by [`TwoLevelMap::set_layer`](crate::TwoLevelMap::set_layer).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerError {
    /// A primary key must never map to a layer with no secondary keys.
    #[error("cannot install an empty secondary layer")]
    EmptyLayer,
}
