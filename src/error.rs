//! Error taxonomies for the overlay's public boundaries.
//!
//! Internal async plumbing uses [`anyhow::Result`]; the types here cover the
//! seams where callers need to branch on the failure kind: the record store,
//! the messenger boundary, the advertisement codec, and pipe resolution.

use thiserror::Error;

/// Failures surfaced by the expiring record store.
///
/// Routine queries never see `Storage`: storage-layer faults on read paths
/// are logged and degraded to "not found" at the store boundary. `Storage`
/// is reserved for mutations that could not take effect.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller supplied arguments the store cannot honor, e.g. a zero
    /// lifetime or an expiration exceeding the lifetime.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The underlying storage rejected the operation.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Failures surfaced by the messenger boundary.
#[derive(Debug, Error)]
pub enum SendError {
    /// The destination has no usable route hint.
    #[error("no route to peer {0}")]
    NoRoute(String),
    /// The destination's route hint could not be parsed.
    #[error("malformed destination address: {0}")]
    BadAddress(String),
    /// The transport failed while delivering the message.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failures surfaced by the advertisement codec boundary.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes did not parse as an advertisement document.
    #[error("unparseable advertisement document: {0}")]
    Malformed(String),
    /// The document parsed but carried fields the codec cannot accept.
    #[error("invalid advertisement field: {0}")]
    InvalidField(String),
}

/// Failures surfaced by synchronous pipe resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A peer answered negatively: the pipe is known to be absent there.
    /// Distinct from [`ResolveError::Timeout`] so callers can tell "nobody
    /// answered" apart from "somebody answered no".
    #[error("pipe {0} not present on queried peers")]
    Nak(String),
    /// No response arrived within the caller-specified timeout.
    #[error("pipe {0} not resolved within timeout")]
    Timeout(String),
    /// The resolver was shut down while the query was outstanding.
    #[error("resolver closed")]
    Closed,
}
