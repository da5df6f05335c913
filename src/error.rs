use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToneLinkError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Transmission aborted: {0}")]
    TransmissionAborted(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),

    #[error("Invalid WAV data: {0}")]
    InvalidWav(String),

    #[error("Timeout waiting for audio device")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ToneLinkError>;
