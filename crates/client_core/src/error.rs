use shared::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Receive(String),
    #[error("transport is unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request rejected with status {status} ({code:?}): {detail}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        detail: String,
    },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload requires an active room")]
    NoActiveRoom,
    #[error("failed to read '{path}': {reason}")]
    ReadFile { path: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("no recording is in progress")]
    NotRecording,
    #[error("microphone access denied: {0}")]
    MicrophoneAccessDenied(String),
    #[error("no audio was captured")]
    EmptyCapture,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },
}
