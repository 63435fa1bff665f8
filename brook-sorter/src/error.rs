use thiserror::Error;

/// Fatal failures of the sort pipeline.
///
/// None of these are retried locally. They are carried inside `anyhow::Error`
/// so call sites can attach context and callers can still downcast to the
/// kind.
#[derive(Debug, Error)]
pub enum SorterError {
    /// A resolved marker moved backwards on one heap sorter's input. This is
    /// an upstream bug: a resolved timestamp is a promise about the future of
    /// the stream and must never regress.
    #[error("resolved ts regression, current: {current}, last max: {max}")]
    ResolvedTsRegression { current: u64, max: u64 },

    #[error("backend write failed: {0}")]
    BackendWrite(#[source] std::io::Error),

    #[error("backend read failed: {0}")]
    BackendRead(#[source] std::io::Error),

    /// The backend pool could not produce a backend. Once a run cannot be
    /// stored the ordering guarantee is gone, so this is fatal.
    #[error("backend allocation failed: {0}")]
    Alloc(#[source] std::io::Error),

    /// A spill file ended mid-record or produced an undecodable payload.
    #[error("corrupted run: {reason}")]
    CorruptRun { reason: String },
}
