use thiserror::Error;

/// Terminal failures delivered to the downstream consumer.
///
/// The raw OS error number is carried verbatim so the consumer can report
/// the original cause. Spill file I/O never gets retried; the first failure
/// pushes the whole channel into error mode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to create spill file (os error {0})")]
    Open(i32),

    #[error("failed to write to spill file (os error {0})")]
    Write(i32),

    #[error("failed to read from spill file (os error {0})")]
    Read(i32),

    #[error("channel error (os error {0})")]
    Errno(i32),
}

impl ChannelError {
    /// The raw OS error number carried by this error.
    pub fn errno(&self) -> i32 {
        match *self {
            ChannelError::Open(errno)
            | ChannelError::Write(errno)
            | ChannelError::Read(errno)
            | ChannelError::Errno(errno) => errno,
        }
    }
}

pub(crate) fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}
