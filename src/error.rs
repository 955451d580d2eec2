use thiserror::Error;

/// Failure talking to the metering API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid API URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("connection error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A poll cycle that produced no data.
#[derive(Debug, Error)]
#[error("error fetching {name} data: {source}")]
pub struct UpdateFailed {
    pub name: String,
    #[source]
    pub source: ApiError,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access entry store `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("entry store `{path}` is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("integration not ready: {0}")]
    NotReady(#[from] UpdateFailed),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no config entry has been set up")]
    NoEntry,
}
