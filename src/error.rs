use thiserror::Error;

/// Errors raised by the advisory engine.
///
/// All of these are fatal for the current snapshot: the caller logs the
/// error, discards the snapshot and waits for the next refresh. The engine
/// never emits partial results.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A configuration value is outside its documented bounds.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The snapshot contradicts itself (missing channel, balance out of
    /// range, history not ordered latest-first).
    #[error("snapshot invariant violated: {0}")]
    SnapshotInvariant(String),

    /// The decision tree reached a state that a prior step should have
    /// ruled out. Indicates a logic error, not bad input.
    #[error("impossible state in decision tree: {0}")]
    Computation(String),
}
