//! Recoverable failures. Contract violations (bad addresses, unexpected
//! entries, reserved bits) are not represented here; they panic at the point
//! of detection.

use alloc::string::String;

/// A failure reported by the hypervisor control interface.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlError {
    /// The supplied buffer cannot hold the result. `required` is the number of
    /// entries the call needs.
    #[error("buffer too small, {required} entries required")]
    TooBig { required: usize },

    /// The requested attribute or feature does not exist on this platform.
    #[error("not supported")]
    Unsupported,

    #[error("errno {0}")]
    Errno(i32),
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A required capability or CPU feature is absent. The caller is expected
    /// to skip the test rather than fail it.
    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("{call} failed: {source}")]
    Ioctl {
        call: &'static str,
        #[source]
        source: IoctlError,
    },

    /// A batched MSR access stopped before processing every entry.
    #[error("{call} failed, MSR index: {index:#x} ({processed} of {total} processed)")]
    MsrBatch {
        call: &'static str,
        index: u32,
        processed: usize,
        total: usize,
    },

    #[error("unsupported number of args: {0}, expected 1 to 6")]
    InvalidArgCount(usize),

    #[error("failed to format the dump")]
    Format(#[from] core::fmt::Error),
}

impl Error {
    /// Tests whether this error means "skip", as opposed to "fail".
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Attaches the control interface call name to an [`IoctlError`].
pub(crate) trait IoctlResultExt<T> {
    fn ioctl(self, call: &'static str) -> Result<T, Error>;
}

impl<T> IoctlResultExt<T> for Result<T, IoctlError> {
    fn ioctl(self, call: &'static str) -> Result<T, Error> {
        self.map_err(|source| Error::Ioctl { call, source })
    }
}
