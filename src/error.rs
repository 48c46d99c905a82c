use thiserror::Error;

/// Error type for host operations.
///
/// Per-callback problems never surface here: the audio callback signals the
/// driver with [`crate::driver::CallbackResult::Stop`] instead of returning
/// a `Result`.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Ringbuffer capacity {0} is not a power of two")]
    BadCapacity(usize),

    #[error("Plugin not found for URI: {0}")]
    PluginNotFound(String),

    #[error("Plugin requires unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Plugin instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Message of {size} bytes exceeds buffer capacity {capacity}")]
    TooLarge { size: usize, capacity: usize },

    #[error("No space left in ringbuffer")]
    NoSpace,

    #[error("Port {index} is not a {expected} port")]
    WrongPortKind { index: u32, expected: &'static str },

    #[error("Operation invalid in state {0:?}")]
    NotReady(crate::host::HostState),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State error: {0}")]
    State(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, HostError>;
