pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("device not capable: {0}")]
    DeviceNotCapable(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Error::Channel(msg.into())
    }

    pub fn encoding<S: Into<String>>(msg: S) -> Self {
        Error::InvalidEncoding(msg.into())
    }

    pub fn timeout<S: Into<String>>(after: std::time::Duration, what: S) -> Self {
        Error::Timeout(after, what.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn process<S: Into<String>>(msg: S) -> Self {
        Error::Process(msg.into())
    }

    pub fn invalid_args<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgs(msg.into())
    }

    /// Wraps the current `errno` with the name of the failing call.
    pub(crate) fn last_os(call: &str) -> Self {
        let err = std::io::Error::last_os_error();
        Error::Io(std::io::Error::new(err.kind(), format!("{call}: {err}")))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(..))
    }
}
