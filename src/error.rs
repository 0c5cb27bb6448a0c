// SPDX-License-Identifier: Apache-2.0

//! Errors and result codes for enclave image loading

use std::fmt;

/// The coarse outcome of an image operation.
///
/// Every [`Error`] collapses onto exactly one of these codes so that callers
/// which only care about the class of a failure can branch on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Ok,

    /// An argument was missing or structurally invalid.
    InvalidParameter,

    /// A section or resource was not usable.
    Failure,

    /// The enclave properties structure is absent.
    NotFound,
}

impl Status {
    /// Returns the code of any operation outcome.
    #[inline]
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::InvalidParameter => "INVALID_PARAMETER",
            Status::Failure => "FAILURE",
            Status::NotFound => "NOT_FOUND",
        };

        f.write_str(name)
    }
}

/// An error raised while loading, patching or enumerating an enclave image
#[derive(Debug)]
pub enum Error {
    /// A caller supplied argument is invalid.
    InvalidParameter(&'static str),

    /// The image file could not be read or written.
    Io(std::io::Error),

    /// The ELF decoder rejected the image.
    Goblin(goblin::error::Error),

    /// The image decoded, but its geometry or relocations are malformed.
    Format(String),

    /// The file is not in any supported image format.
    UnknownFormat,

    /// The enclave properties section was never located.
    NotFound,

    /// The enclave properties section exists but has the wrong shape.
    Properties(String),

    /// `sgx_patch` was already applied to this image.
    AlreadyPatched,

    /// The load context rejected a page.
    Context(anyhow::Error),
}

impl Error {
    /// The result code this error reports as.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidParameter(_) => Status::InvalidParameter,
            Error::NotFound => Status::NotFound,
            Error::Io(_)
            | Error::Goblin(_)
            | Error::Format(_)
            | Error::UnknownFormat
            | Error::Properties(_)
            | Error::AlreadyPatched
            | Error::Context(_) => Status::Failure,
        }
    }

    #[inline]
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Goblin(e) => write!(f, "malformed image: {}", e),
            Error::Format(msg) => write!(f, "malformed image: {}", msg),
            Error::UnknownFormat => f.write_str("unrecognized image format"),
            Error::NotFound => f.write_str("enclave properties not found"),
            Error::Properties(msg) => write!(f, "invalid enclave properties: {}", msg),
            Error::AlreadyPatched => f.write_str("image is already patched"),
            Error::Context(e) => write!(f, "load context rejected page: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Goblin(e) => Some(e),
            Error::Context(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<goblin::error::Error> for Error {
    #[inline]
    fn from(value: goblin::error::Error) -> Self {
        Error::Goblin(value)
    }
}

impl From<anyhow::Error> for Error {
    #[inline]
    fn from(value: anyhow::Error) -> Self {
        Error::Context(value)
    }
}

/// The result of an enclave image operation
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(Error::NotFound.status(), Status::NotFound);
        assert_eq!(
            Error::InvalidParameter("x").status(),
            Status::InvalidParameter
        );
        assert_eq!(Error::format("bad").status(), Status::Failure);
        assert_eq!(Error::AlreadyPatched.status(), Status::Failure);
        assert_eq!(
            Error::from(anyhow::anyhow!("EPC exhausted")).status(),
            Status::Failure
        );
    }

    #[test]
    fn status_of_result() {
        let ok: Result<()> = Ok(());
        let missing: Result<()> = Err(Error::NotFound);

        assert_eq!(Status::of(&ok), Status::Ok);
        assert_eq!(Status::of(&missing), Status::NotFound);
        assert_eq!(Status::NotFound.to_string(), "NOT_FOUND");
    }

    #[test]
    fn context_error_is_kept_verbatim() {
        let err = Error::from(anyhow::anyhow!("EPC exhausted"));
        assert!(err.to_string().contains("EPC exhausted"));
    }
}
