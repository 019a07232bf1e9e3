use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Status fetch failed: {0}")]
    StatusFetch(String),
    
    #[error("Invalid tracker configuration: {0}")]
    InvalidConfig(String),
    
    #[error("Tracker is already running")]
    AlreadyRunning,
    
    #[error("Tracker has been disposed")]
    Disposed,
    
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
