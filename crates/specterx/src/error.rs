//! Status codes and the crate-wide error type.
//!
//! Every fallible entry point in this crate reports failures through
//! [`SpecterError`]. The enum covers the closed set of conditions callers are
//! expected to branch on, and anything else is carried verbatim as the raw
//! NTSTATUS of the failing call. [`SpecterError::status`] maps every variant
//! back into the native status space for diagnostics.

use thiserror::Error;

/// Status code as returned by the ntdll system call layer.
pub type NtStatus = i32;

pub const STATUS_SUCCESS: NtStatus = 0;
pub const STATUS_PARTIAL_COPY: NtStatus = 0x8000_000D_u32 as i32;
pub const STATUS_NO_MORE_ENTRIES: NtStatus = 0x8000_001A_u32 as i32;
pub const STATUS_UNSUCCESSFUL: NtStatus = 0xC000_0001_u32 as i32;
pub const STATUS_INFO_LENGTH_MISMATCH: NtStatus = 0xC000_0004_u32 as i32;
pub const STATUS_INVALID_PARAMETER: NtStatus = 0xC000_000D_u32 as i32;
pub const STATUS_ACCESS_DENIED: NtStatus = 0xC000_0022_u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: NtStatus = 0xC000_0023_u32 as i32;
pub const STATUS_OBJECT_NAME_NOT_FOUND: NtStatus = 0xC000_0034_u32 as i32;
pub const STATUS_INVALID_IMAGE_FORMAT: NtStatus = 0xC000_007B_u32 as i32;
pub const STATUS_INVALID_PARAMETER_1: NtStatus = 0xC000_00EF_u32 as i32;
pub const STATUS_INVALID_PARAMETER_2: NtStatus = 0xC000_00F0_u32 as i32;
pub const STATUS_INVALID_PARAMETER_3: NtStatus = 0xC000_00F1_u32 as i32;
pub const STATUS_INVALID_PARAMETER_4: NtStatus = 0xC000_00F2_u32 as i32;
pub const STATUS_NOT_FOUND: NtStatus = 0xC000_0225_u32 as i32;

// Win32 error codes that get a dedicated variant when translated.
const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;
const ERROR_NOT_FOUND: u32 = 1168;

// Severity and facility bits applied when a Win32 error code has no better
// mapping into the native status space.
const FACILITY_NTWIN32: u32 = 0xC007_0000;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, SpecterError>;

/// Failure conditions surfaced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpecterError {
    /// The numbered argument failed validation before any resource was touched.
    #[error("parameter {0} is invalid")]
    InvalidParameter(u32),

    /// No entry matched the requested scope or name.
    #[error("no matching entry was found")]
    NotFound,

    /// The granted access rights do not cover the requested operation.
    #[error("access to the target was denied")]
    AccessDenied,

    /// The negotiated buffer never became large enough.
    #[error("buffer is too small for the requested data")]
    BufferTooSmall,

    /// A named object could not be resolved.
    #[error("object name was not found")]
    ObjectNameNotFound,

    /// The mapped file is not a well-formed executable image.
    #[error("image format is invalid")]
    InvalidImageFormat,

    /// A native call failed with a status outside the closed set above.
    #[error("{0} failed with status {1:#010x}")]
    ApiCallFailed(&'static str, NtStatus),

    /// The operation could not be completed.
    #[error("operation was unsuccessful")]
    Unsuccessful,
}

impl SpecterError {
    /// Maps the error back into the native status space.
    pub fn status(&self) -> NtStatus {
        match *self {
            Self::InvalidParameter(1) => STATUS_INVALID_PARAMETER_1,
            Self::InvalidParameter(2) => STATUS_INVALID_PARAMETER_2,
            Self::InvalidParameter(3) => STATUS_INVALID_PARAMETER_3,
            Self::InvalidParameter(4) => STATUS_INVALID_PARAMETER_4,
            Self::InvalidParameter(_) => STATUS_INVALID_PARAMETER,
            Self::NotFound => STATUS_NOT_FOUND,
            Self::AccessDenied => STATUS_ACCESS_DENIED,
            Self::BufferTooSmall => STATUS_BUFFER_TOO_SMALL,
            Self::ObjectNameNotFound => STATUS_OBJECT_NAME_NOT_FOUND,
            Self::InvalidImageFormat => STATUS_INVALID_IMAGE_FORMAT,
            Self::ApiCallFailed(_, status) => status,
            Self::Unsuccessful => STATUS_UNSUCCESSFUL,
        }
    }

    /// Classifies a failing NTSTATUS into the closed error set.
    pub(crate) fn from_status(api: &'static str, status: NtStatus) -> Self {
        match status {
            STATUS_ACCESS_DENIED => Self::AccessDenied,
            STATUS_NOT_FOUND | STATUS_NO_MORE_ENTRIES => Self::NotFound,
            STATUS_OBJECT_NAME_NOT_FOUND => Self::ObjectNameNotFound,
            STATUS_BUFFER_TOO_SMALL | STATUS_INFO_LENGTH_MISMATCH => Self::BufferTooSmall,
            STATUS_INVALID_IMAGE_FORMAT => Self::InvalidImageFormat,
            STATUS_UNSUCCESSFUL => Self::Unsuccessful,
            _ => Self::ApiCallFailed(api, status),
        }
    }

    /// Translates a Win32 last-error code into the shared status vocabulary.
    pub(crate) fn from_win32(api: &'static str, code: u32) -> Self {
        match code {
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => Self::ObjectNameNotFound,
            ERROR_ACCESS_DENIED => Self::AccessDenied,
            ERROR_INSUFFICIENT_BUFFER => Self::BufferTooSmall,
            ERROR_SERVICE_DOES_NOT_EXIST => Self::ObjectNameNotFound,
            ERROR_NOT_FOUND => Self::NotFound,
            _ => Self::ApiCallFailed(api, ((code & 0xFFFF) | FACILITY_NTWIN32) as NtStatus),
        }
    }

    /// Captures the calling thread's last Win32 error.
    #[cfg(windows)]
    pub(crate) fn last_error(api: &'static str) -> Self {
        // SAFETY: GetLastError only reads thread-local state.
        let code = unsafe { windows_sys::Win32::Foundation::GetLastError() };
        Self::from_win32(api, code)
    }
}

/// Success test matching the NT_SUCCESS macro.
pub(crate) fn nt_success(status: NtStatus) -> bool {
    status >= 0
}

/// Resolves the human-readable message for a status code out of ntdll's
/// message table. Returns an empty string when the code has no entry.
#[cfg(windows)]
pub fn status_message(status: NtStatus) -> String {
    use windows_sys::Win32::System::Diagnostics::Debug::{
        FormatMessageW, FORMAT_MESSAGE_FROM_HMODULE, FORMAT_MESSAGE_FROM_SYSTEM,
        FORMAT_MESSAGE_IGNORE_INSERTS,
    };
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

    use crate::utils::strings;

    let module = strings::to_wide("ntdll.dll");
    let mut buffer = [0u16; 260];

    // SAFETY: the module name and output buffer stay alive across both calls.
    let written = unsafe {
        let ntdll = GetModuleHandleW(module.as_ptr());
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_FROM_HMODULE | FORMAT_MESSAGE_IGNORE_INSERTS,
            ntdll.cast(),
            status as u32,
            0,
            buffer.as_mut_ptr(),
            buffer.len() as u32,
            core::ptr::null(),
        )
    };

    strings::from_wide(&buffer[..written as usize])
}
