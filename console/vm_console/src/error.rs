use thiserror::Error;
use std::io;

use crate::api_client::ApiError;
use power_tracker::TrackerError;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    
    #[error("Configuration error: {0}")]
    ConfigError(String),
    
    #[error("API error: {0}")]
    ApiError(#[from] ApiError),
    
    #[error("Tracker error: {0}")]
    TrackerError(#[from] TrackerError),
    
    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
