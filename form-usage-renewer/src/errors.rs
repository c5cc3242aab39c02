use thiserror::Error;

use crate::transport::CollectorResponse;

/// Error types for calls made through the resilient collector transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Error when the circuit breaker is open
    #[error("Circuit breaker open, not sending request")]
    CircuitBreakerOpen,

    /// Error when the collector cannot be reached
    #[error("Failed to connect to collector: {0}")]
    ConnectionError(String),

    /// Error during HTTP communication
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The collector answered with a server error; retried until the policy is exhausted
    #[error("Collector answered with status {}", .0.status)]
    ServerStatus(CollectorResponse),

    /// A URI template referenced a parameter that was not supplied
    #[error("Invalid request URI: {0}")]
    InvalidUri(String),

    /// Error during body serialization
    #[error("Failed to serialize request body: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Error types reported by a carry-over store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store could not be read or written
    #[error("Carry-over store unavailable: {0}")]
    Unavailable(String),

    /// The submission response did not identify the stored usage
    #[error("Submission response has no location header")]
    MissingLocation,

    /// Error while encoding or decoding persisted records
    #[error("Failed to encode carry-over records: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Carry-over store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while retrieving the latest usage of a resource
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("usage fetch failed: {0}")]
    Transport(TransportError),

    #[error("usage fetch answered with status {0}")]
    Status(u16),

    #[error("fetched usage is not a usage document: {0}")]
    InvalidBody(serde_json::Error),
}

/// Failure while resubmitting a renewed usage document
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("usage submission failed: {0}")]
    Transport(TransportError),

    #[error("usage submission answered with status {0}")]
    Status(u16),

    #[error("usage submission accepted without a location header")]
    MissingLocation,

    #[error("failed to encode renewed usage: {0}")]
    Serialization(serde_json::Error),
}

/// Error scoped to a single carry-over record. Never aborts a renewal pass.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("failed to persist carry-over record: {0}")]
    Persist(#[from] StoreError),
}

/// Error that ends a renewal pass without completing it
#[derive(Error, Debug)]
pub enum PassError {
    /// A page of the carry-over store could not be read, the remaining records are unreachable
    #[error("Failed to scan carry-over store: {0}")]
    Scan(StoreError),

    /// Another pass is still in flight
    #[error("A renewal pass is already running")]
    AlreadyRunning,
}
