//! Error taxonomy
//!
//! Would-block and interrupted syscalls never show up here: `DataChannel`
//! absorbs them. Everything below tears the connection down.

use std::io;

/// Fatal failure of a socket or file syscall
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("{syscall} failed: {}", io::Error::from_raw_os_error(*errno))]
    Syscall { syscall: &'static str, errno: i32 },

    #[error("{syscall} called with an empty buffer")]
    EmptyBuffer { syscall: &'static str },

    /// The file ended before the requested range was sent
    #[error("response file ended at offset {offset}")]
    FileEnded { offset: u64 },
}

impl ChannelError {
    /// Capture `errno` of the syscall that just failed
    pub(crate) fn last_os_error(syscall: &'static str) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::Syscall { syscall, errno }
    }

    pub fn errno(&self) -> i32 {
        match self {
            Self::Syscall { errno, .. } => *errno,
            Self::EmptyBuffer { .. } => libc::EINVAL,
            Self::FileEnded { .. } => libc::EIO,
        }
    }

    pub fn syscall(&self) -> &'static str {
        match self {
            Self::Syscall { syscall, .. } | Self::EmptyBuffer { syscall } => syscall,
            Self::FileEnded { .. } => "sendfile",
        }
    }
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Syscall { errno, .. } => io::Error::from_raw_os_error(errno),
            ChannelError::EmptyBuffer { syscall } => {
                io::Error::new(io::ErrorKind::InvalidInput, format!("{syscall}: empty buffer"))
            }
            ChannelError::FileEnded { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        }
    }
}

/// Why a connection could not be moved to another worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SwitchFailure {
    #[error("takeover queue of thread {thread_index} is full")]
    Overflow { thread_index: u16 },

    #[error("no worker thread {thread_index}")]
    NoSuchThread { thread_index: u16 },
}

impl SwitchFailure {
    /// `true` when the target exists but its queue was full
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

/// Protocol violation detected by a packet handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("body of {size} bytes exceeds limit of {limit}")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("header rejected: {0}")]
    HeaderRejected(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::Syscall {
            syscall: "send",
            errno: libc::EPIPE,
        };
        assert!(err.to_string().starts_with("send failed"));
        assert_eq!(err.errno(), libc::EPIPE);
        assert_eq!(err.syscall(), "send");

        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn test_empty_buffer_maps_to_einval() {
        let err = ChannelError::EmptyBuffer { syscall: "recv" };
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_switch_failure_kind() {
        assert!(SwitchFailure::Overflow { thread_index: 1 }.is_overflow());
        assert!(!SwitchFailure::NoSuchThread { thread_index: 9 }.is_overflow());
    }
}
