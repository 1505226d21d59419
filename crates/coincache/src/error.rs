//! Error types for the coins views.

/// Errors surfaced by a coins view.
///
/// Only failures of the backing store appear here. Misuse of the cache
/// protocol itself (overwriting an unspent coin without permission, a `FRESH`
/// flag against a live parent entry, a flush that leaves entries behind) is a
/// bug in the caller and panics instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing store failed while reading a coin.
    #[error("failed to read from the coins database: {0}")]
    BackendRead(String),

    /// The backing store failed while absorbing a batch write.
    #[error("failed to write the coin batch to the backing store: {0}")]
    BackendWrite(String),
}
