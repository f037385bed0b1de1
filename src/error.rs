//! Crate-boundary error type: a flat `thiserror` enum at the library boundary, with no `anyhow`
//! layered above it since there is no runtime context to hang `anyhow::Context` off of. Every
//! fallible public operation returns [`PagerError`] directly.

use strum_macros::IntoStaticStr;

/// Errors surfaced at the pager's public API.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum PagerError {
    /// Eviction could not bring `size_used` below the effective hard limit.
    #[error("out of memory: charge would exceed the hard limit even after eviction")]
    OutOfMemory,

    /// A read reached the end of the file before filling the requested range.
    #[error("end of file")]
    EndOfFile,

    /// The underlying file descriptor was invalid (closed, or never opened).
    #[error("invalid file descriptor")]
    InvalidFileDescriptor,

    /// The read's offset/length fell outside the process's accessible address space.
    #[error("read parameters outside accessible address space")]
    ParamsOutsideAccessibleAddressSpace,

    /// Anything else the OS or the ring reported that doesn't map to a named category.
    #[error("unexpected I/O error (errno {0})")]
    UnexpectedError(i32),
}

impl PagerError {
    /// Map a raw, negative `io_uring` completion result (an `-errno`) to a domain error, before
    /// the callback fires.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => PagerError::InvalidFileDescriptor,
            libc::EFAULT => PagerError::ParamsOutsideAccessibleAddressSpace,
            libc::ENOMEM => PagerError::OutOfMemory,
            other => PagerError::UnexpectedError(other),
        }
    }

    /// A stable code used to pack this error into the lazy slot's Failed state: a sentinel marker
    /// bit plus, for `UnexpectedError`, the errno's low 31 bits (sign restored by [`Self::decode`]
    /// via sign-extending bit 30, so the round trip is lossless for every real errno, including
    /// negative sentinels).
    pub fn encode(self) -> u32 {
        match self {
            PagerError::OutOfMemory => 1,
            PagerError::EndOfFile => 2,
            PagerError::InvalidFileDescriptor => 3,
            PagerError::ParamsOutsideAccessibleAddressSpace => 4,
            PagerError::UnexpectedError(errno) => 0x8000_0000 | ((errno as u32) & 0x7FFF_FFFF),
        }
    }

    /// Inverse of [`Self::encode`].
    pub fn decode(code: u32) -> Self {
        match code {
            1 => PagerError::OutOfMemory,
            2 => PagerError::EndOfFile,
            3 => PagerError::InvalidFileDescriptor,
            4 => PagerError::ParamsOutsideAccessibleAddressSpace,
            other if other & 0x8000_0000 != 0 => {
                // Sign-extend bit 30 back into bit 31 to recover the original errno.
                let low31 = other & 0x7FFF_FFFF;
                let errno = ((low31 << 1) as i32) >> 1;
                PagerError::UnexpectedError(errno)
            }
            other => PagerError::UnexpectedError(other as i32),
        }
    }
}

/// Sentinel errno used when `std::io::Error::raw_os_error()` returns `None` (the error did not
/// originate from a raw OS error code). Fixed and out of the real errno range so it round-trips
/// through [`PagerError::encode`]/[`PagerError::decode`] unambiguously rather than colliding with
/// a genuine errno.
const NO_RAW_OS_ERROR: i32 = -1;

impl From<std::io::Error> for PagerError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => PagerError::from_errno(errno),
            None => PagerError::UnexpectedError(NO_RAW_OS_ERROR),
        }
    }
}

pub type Result<T> = std::result::Result<T, PagerError>;
