use thiserror::Error;

/// Errors surfaced to callers. Reads of feature values never fail; these cover configuration,
/// explicit JSON decoding, update payloads and lifecycle misuse.
#[derive(Error, Debug)]
pub enum Error {
    #[error("an API key is required")]
    MissingApiKey,
    #[error("invalid edge url {0:?}: expected an http or https url")]
    InvalidEdgeUrl(String),
    #[error("unable to read configuration: {0}")]
    InvalidConfig(#[source] serde_json::Error),
    #[error("unable to decode feature {key} as json: {source}")]
    JsonDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed {state} event: {source}")]
    MalformedEvent {
        state: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown event type {0:?}")]
    UnknownEvent(String),
    #[error("{0} has been closed")]
    Closed(&'static str),
    #[error("edge error: {0}")]
    Edge(String),
    #[error("worker pool has been shut down")]
    ExecutorShutdown,
    #[error("unable to start worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Result type for fallible client operations
pub type Result<T> = std::result::Result<T, Error>;
