//! Error types for the streaming client

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio capture errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The device dropped samples (XRUN); recover with `prepare`.
    #[error("Capture overrun")]
    Overrun,

    #[error("Capture device stopped")]
    DeviceStopped,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Right shift of a negative integer was not arithmetic on this
    /// target; UNICAM coding cannot work.
    #[error("Arithmetic right-shift self-test failed")]
    ArithmeticShift,

    #[error("Unsupported UNICAM coded sample size: {0} bits (only 8 supported)")]
    UnsupportedCodedSampleSize(u32),

    #[error("Unsupported UNICAM decoded sample size: {0} bits (only 16 supported)")]
    UnsupportedDecodedSampleSize(u32),

    #[error("Invalid block length: expected {expected} words, got {got}")]
    InvalidBlockLength { expected: usize, got: usize },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Could not resolve server address: {0}")]
    ResolveFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("Socket configuration failed: {0}")]
    SocketConfig(std::io::Error),

    #[error("Send failed: {0}")]
    Send(std::io::Error),

    /// The wall-clock send deadline expired with bytes still unsent.
    #[error("Send deadline expired with {remaining} bytes unsent")]
    SendTimeout { remaining: usize },

    #[error("Invalid packet format")]
    InvalidPacket,
}

/// ENOBUFS has no `io::ErrorKind` mapping.
const ENOBUFS: i32 = 105;

impl NetworkError {
    /// True if the underlying error is one of the errno values that mean
    /// the socket itself has gone bad (ENOTCONN, ECONNRESET, ENOBUFS,
    /// EPIPE) rather than a transient send problem.
    pub fn is_fatal_socket(&self) -> bool {
        match self {
            NetworkError::Send(e) | NetworkError::ConnectionFailed(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                ) || e.raw_os_error() == Some(ENOBUFS)
            }
            _ => false,
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
