/// Error taxonomy for the mesh-node core.
///
/// Per-frame malformed input is never surfaced as a `Result` — analyzers drop
/// and count (see `scanner::parse_wifi_frame`'s `Option` convention). This
/// type covers the conditions that *do* need to reach an operator: invalid
/// configuration, storage failure, and triangulation impossibility.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Operator-supplied configuration rejected outright; state is unchanged.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),

    /// Persistent storage unavailable or corrupt; core continues RAM-only.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Triangulation could not produce a position this session.
    #[error("triangulation impossible: {0}")]
    TriangulationImpossible(String),

    /// Radio could not enter the requested mode; previous state retained.
    #[error("radio transition failed: {0}")]
    RadioTransition(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
