use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Stored record is not a well-formed event.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A local handler returned an error or panicked.
    #[error("Handler error on channel {channel}: {message}")]
    Handler { channel: String, message: String },

    /// Ownership write lost the compare-and-swap race too many times.
    #[error("Ownership conflict: {0}")]
    Conflict(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// True for failures worth retrying: network I/O, timeouts, dropped
    /// connections and a store that is still loading.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            Self::Connection(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
