use thiserror::Error;

/// Errors surfaced at the byte-source boundary.
///
/// Extraction itself never fails; a malformed image degrades to a record
/// carrying only the source identifier. Errors exist only where bytes are
/// fetched from the outside world.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request itself failed (connect, timeout, transport).
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("request for {url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}
