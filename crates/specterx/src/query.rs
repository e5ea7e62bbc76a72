//! Buffer size negotiation for the variable-length native query services.
//!
//! The kernel reports how much space a query needs only after being asked, so
//! every variable-length information class goes through the same loop: guess a
//! size, issue the query, and on a size-related status reallocate at the
//! reported size (or double when nothing authoritative was reported) and try
//! again. The loop is bounded so a misbehaving kernel cannot spin it forever.

use log::trace;

use crate::error::{
    nt_success, NtStatus, Result, SpecterError, STATUS_BUFFER_TOO_SMALL,
    STATUS_INFO_LENGTH_MISMATCH,
};

#[cfg(windows)]
use {
    core::{mem, ptr},
    ntapi::{ntexapi::NtQuerySystemInformation, ntobapi::NtQueryObject, ntpsapi::NtQueryInformationProcess},
    winapi::shared::ntdef::HANDLE,
};

/// Upper bound on resize-and-retry rounds for a single query.
pub(crate) const MAX_QUERY_ATTEMPTS: usize = 8;

/// Fallback size when a system class refuses to report its requirement.
#[cfg(windows)]
const DEFAULT_SYSTEM_QUERY_SIZE: usize = 0x1000;

/// Name and type records are bounded by the object manager at a page.
#[cfg(windows)]
const OBJECT_NAME_QUERY_SIZE: usize = 0x1000;

/// System-wide information selectors understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInformationClass {
    /// Loaded kernel modules (drivers).
    Modules,
    /// Running processes with their extended thread records.
    Processes,
}

impl SystemInformationClass {
    /// Raw platform selector.
    pub fn raw(self) -> u32 {
        match self {
            Self::Modules => 11,   // SystemModuleInformation
            Self::Processes => 57, // SystemExtendedProcessInformation
        }
    }
}

/// Per-process information selectors understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessInformationClass {
    Basic,
    QuotaLimits,
    IoCounters,
    VmCounters,
    Times,
    PriorityClass,
    HandleCount,
    Session,
    Wow64,
    ImageFileName,
    ExecuteFlags,
    ImageInformation,
}

impl ProcessInformationClass {
    /// Raw platform selector.
    pub fn raw(self) -> u32 {
        match self {
            Self::Basic => 0,
            Self::QuotaLimits => 1,
            Self::IoCounters => 2,
            Self::VmCounters => 3,
            Self::Times => 4,
            Self::PriorityClass => 18,
            Self::HandleCount => 20,
            Self::Session => 24,
            Self::Wow64 => 26,
            Self::ImageFileName => 27,
            Self::ExecuteFlags => 34,
            Self::ImageInformation => 37,
        }
    }

    /// Minimum buffer size for the record shape this class returns.
    #[cfg(windows)]
    pub fn required_size(self) -> usize {
        use ntapi::ntmmapi::SECTION_IMAGE_INFORMATION;
        use ntapi::ntpsapi::{
            KERNEL_USER_TIMES, PROCESS_BASIC_INFORMATION, PROCESS_PRIORITY_CLASS,
            PROCESS_SESSION_INFORMATION, VM_COUNTERS,
        };
        use winapi::shared::minwindef::MAX_PATH;
        use winapi::shared::ntdef::UNICODE_STRING;
        use winapi::um::winnt::{IO_COUNTERS, QUOTA_LIMITS};

        match self {
            Self::Basic => mem::size_of::<PROCESS_BASIC_INFORMATION>(),
            Self::QuotaLimits => mem::size_of::<QUOTA_LIMITS>(),
            Self::IoCounters => mem::size_of::<IO_COUNTERS>(),
            Self::VmCounters => mem::size_of::<VM_COUNTERS>(),
            Self::Times => mem::size_of::<KERNEL_USER_TIMES>(),
            Self::PriorityClass => mem::size_of::<PROCESS_PRIORITY_CLASS>(),
            Self::HandleCount => mem::size_of::<u32>(),
            Self::Session => mem::size_of::<PROCESS_SESSION_INFORMATION>(),
            Self::Wow64 => mem::size_of::<usize>(),
            Self::ImageFileName => mem::size_of::<UNICODE_STRING>() + MAX_PATH * 2,
            Self::ExecuteFlags => mem::size_of::<u32>(),
            Self::ImageInformation => mem::size_of::<SECTION_IMAGE_INFORMATION>(),
        }
    }
}

/// Per-object information selectors understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectInformationClass {
    Basic,
    Name,
    Type,
}

impl ObjectInformationClass {
    /// Raw platform selector.
    pub fn raw(self) -> u32 {
        match self {
            Self::Basic => 0,
            Self::Name => 1,
            Self::Type => 2,
        }
    }

    /// Minimum buffer size for the record shape this class returns.
    #[cfg(windows)]
    pub fn required_size(self) -> usize {
        use ntapi::ntobapi::OBJECT_BASIC_INFORMATION;

        match self {
            Self::Basic => mem::size_of::<OBJECT_BASIC_INFORMATION>(),
            Self::Name | Self::Type => OBJECT_NAME_QUERY_SIZE,
        }
    }
}

/// Owned allocation produced by one negotiated query.
///
/// Backed by 8-byte aligned storage so the kernel record structures laid out
/// inside it can be viewed in place.
#[derive(Debug)]
pub struct QueryBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl QueryBuffer {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            storage: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: storage holds at least `len` initialized bytes.
        unsafe { core::slice::from_raw_parts(self.storage.as_ptr().cast(), self.len) }
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: storage holds at least `len` initialized bytes.
        unsafe { core::slice::from_raw_parts_mut(self.storage.as_mut_ptr().cast(), self.len) }
    }

    fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Views the start of the buffer as a kernel record structure.
    ///
    /// # Safety
    ///
    /// `T` must match the record shape the originating query produced.
    pub(crate) unsafe fn view<T>(&self) -> Result<&T> {
        if self.len < core::mem::size_of::<T>() {
            return Err(SpecterError::BufferTooSmall);
        }
        // SAFETY: storage is 8-byte aligned and long enough, per the check above.
        Ok(unsafe { &*self.storage.as_ptr().cast::<T>() })
    }
}

/// Whether a status is a size negotiation signal rather than a real failure.
pub(crate) fn is_size_signal(status: NtStatus) -> bool {
    status == STATUS_INFO_LENGTH_MISMATCH || status == STATUS_BUFFER_TOO_SMALL
}

/// Next capacity after a size signal: the kernel-reported requirement when it
/// gave one, otherwise double the current guess.
pub(crate) fn grown_capacity(current: usize, reported: usize) -> usize {
    if reported > current {
        reported
    } else {
        current.saturating_mul(2)
    }
}

/// Runs the resize-and-retry loop around `issue` until the query succeeds or
/// fails for a reason unrelated to buffer size.
///
/// `issue` receives the current buffer and returns the raw status plus the
/// length the kernel reported back. On success the buffer is trimmed to the
/// reported length (when one was given) and handed to the caller.
pub(crate) fn negotiate_query<F>(api: &'static str, initial: usize, mut issue: F) -> Result<QueryBuffer>
where
    F: FnMut(&mut [u8]) -> (NtStatus, usize),
{
    let mut capacity = initial.max(1);

    for _ in 0..MAX_QUERY_ATTEMPTS {
        let mut buffer = QueryBuffer::with_len(capacity);
        let (status, reported) = issue(buffer.as_mut_bytes());

        if nt_success(status) {
            if reported > 0 {
                buffer.truncate(reported);
            }
            return Ok(buffer);
        }

        if !is_size_signal(status) {
            return Err(SpecterError::from_status(api, status));
        }

        trace!("{api}: {capacity} bytes too small, kernel reported {reported}");
        capacity = grown_capacity(capacity, reported);
    }

    Err(SpecterError::BufferTooSmall)
}

/// Queries system-wide information, negotiating the buffer size.
#[cfg(windows)]
pub fn query_system_information(class: SystemInformationClass) -> Result<QueryBuffer> {
    let initial = system_required_size(class).unwrap_or(DEFAULT_SYSTEM_QUERY_SIZE);

    negotiate_query("NtQuerySystemInformation", initial, |buffer| {
        let mut returned = 0u32;
        // SAFETY: the buffer outlives the call and its length is passed along.
        let status = unsafe {
            NtQuerySystemInformation(
                class.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                &mut returned,
            )
        };
        (status, returned as usize)
    })
}

/// Probes the kernel for the size a system class currently needs.
#[cfg(windows)]
fn system_required_size(class: SystemInformationClass) -> Option<usize> {
    let mut needed = 0u32;
    // SAFETY: a zero-length query only fills the returned length.
    let status = unsafe { NtQuerySystemInformation(class.raw(), ptr::null_mut(), 0, &mut needed) };

    if status == STATUS_INFO_LENGTH_MISMATCH && needed != 0 {
        Some(needed as usize)
    } else {
        None
    }
}

/// Queries information about a process through an already-open handle.
///
/// The handle must carry query-information access for the requested class;
/// anything less surfaces as an access-denied status.
#[cfg(windows)]
pub fn query_process_information(
    process: HANDLE,
    class: ProcessInformationClass,
) -> Result<QueryBuffer> {
    negotiate_query("NtQueryInformationProcess", class.required_size(), |buffer| {
        let mut returned = 0u32;
        // SAFETY: the buffer outlives the call and its length is passed along.
        let status = unsafe {
            NtQueryInformationProcess(
                process,
                class.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                &mut returned,
            )
        };
        (status, returned as usize)
    })
}

/// Queries information about an arbitrary kernel object handle.
#[cfg(windows)]
pub fn query_object_information(
    handle: HANDLE,
    class: ObjectInformationClass,
) -> Result<QueryBuffer> {
    negotiate_query("NtQueryObject", class.required_size(), |buffer| {
        let mut returned = 0u32;
        // SAFETY: the buffer outlives the call and its length is passed along.
        let status = unsafe {
            NtQueryObject(
                handle,
                class.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                &mut returned,
            )
        };
        (status, returned as usize)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{STATUS_ACCESS_DENIED, STATUS_SUCCESS};

    #[test]
    fn reallocates_once_at_the_reported_size() {
        let mut calls = 0;
        let buffer = negotiate_query("stub", 64, |buffer| {
            calls += 1;
            if buffer.len() < 128 {
                (STATUS_INFO_LENGTH_MISMATCH, 128)
            } else {
                (STATUS_SUCCESS, 128)
            }
        })
        .expect("negotiation should settle");

        assert_eq!(calls, 2);
        assert_eq!(buffer.len(), 128);
    }

    #[test]
    fn doubles_when_no_size_was_reported() {
        let mut sizes = Vec::new();
        let buffer = negotiate_query("stub", 64, |buffer| {
            sizes.push(buffer.len());
            if buffer.len() < 512 {
                (STATUS_BUFFER_TOO_SMALL, 0)
            } else {
                (STATUS_SUCCESS, 0)
            }
        })
        .expect("negotiation should settle");

        assert_eq!(sizes, [64, 128, 256, 512]);
        assert_eq!(buffer.len(), 512);
    }

    #[test]
    fn gives_up_after_a_bounded_number_of_attempts() {
        let mut calls = 0;
        let result = negotiate_query("stub", 32, |_| {
            calls += 1;
            (STATUS_INFO_LENGTH_MISMATCH, 0)
        });

        assert_eq!(result.unwrap_err(), SpecterError::BufferTooSmall);
        assert_eq!(calls, MAX_QUERY_ATTEMPTS);
    }

    #[test]
    fn non_size_failures_abort_immediately() {
        let mut calls = 0;
        let result = negotiate_query("stub", 64, |_| {
            calls += 1;
            (STATUS_ACCESS_DENIED, 0)
        });

        assert_eq!(result.unwrap_err(), SpecterError::AccessDenied);
        assert_eq!(calls, 1);
    }

    #[test]
    fn success_without_reported_length_keeps_the_allocation() {
        let buffer = negotiate_query("stub", 256, |_| (STATUS_SUCCESS, 0))
            .expect("first try should succeed");
        assert_eq!(buffer.len(), 256);
    }

    #[test]
    fn buffer_storage_is_eight_byte_aligned() {
        let buffer = QueryBuffer::with_len(24);
        assert_eq!(buffer.as_bytes().as_ptr() as usize % 8, 0);
        assert_eq!(buffer.len(), 24);
    }
}
