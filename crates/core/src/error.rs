use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Collect request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collect endpoint rejected batch of {events} events with status {status}")]
    Rejected { status: u16, events: usize },

    #[error("Invalid collect url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid tracker config: {reason}")]
    InvalidConfig { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackError>;
