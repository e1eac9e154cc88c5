use thiserror::Error;

/// Failures that put the affected station into `Failed`.
///
/// These are surfaced to the listener as a visible status; they never take
/// the daemon down and never touch other stations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error("could not load stream {url}: {reason}")]
    StreamLoad { url: String, reason: String },
    #[error("playback of {url} was rejected: {reason}")]
    StreamPlay { url: String, reason: String },
    #[error("could not connect {url} to the equalizer: {reason}")]
    GraphAttach { url: String, reason: String },
}

impl PlaybackError {
    pub fn url(&self) -> &str {
        match self {
            PlaybackError::StreamLoad { url, .. }
            | PlaybackError::StreamPlay { url, .. }
            | PlaybackError::GraphAttach { url, .. } => url,
        }
    }
}

/// Now-playing lookups are cosmetic: this error is logged and dropped.
#[derive(Debug, Error)]
pub enum MetadataFetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("no data within {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("probe server answered HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("probe received no data")]
    Empty,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("output device '{0}' not found")]
    DeviceNotFound(String),
    #[error("audio device configuration failed: {0}")]
    Config(String),
    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),
    #[error("audio stream failed: {0}")]
    Stream(String),
    #[error("audio output thread exited before starting")]
    ThreadGone,
}
