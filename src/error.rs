use thiserror::Error;

/// Failure reading container logs. Always transient from the worker's point of view.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("log fetch failed: {0}")]
    Fetch(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification API returned an error: {0}")]
    Api(String),

    #[error("rate limited by notification API")]
    RateLimited,

    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery queue is shut down")]
    Closed,

    #[error("delivery queue is full ({0} pending messages)")]
    Full(usize),
}
