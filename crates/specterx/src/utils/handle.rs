//! Owned wrapper around a raw native handle.

use ntapi::ntobapi::NtClose;
use winapi::shared::ntdef::HANDLE;

/// The pseudo handle referring to the calling process.
pub fn current_process() -> HANDLE {
    -1isize as HANDLE
}

/// A native handle that is closed exactly once, when dropped.
pub struct Handle(HANDLE);

impl Handle {
    /// Takes ownership of a raw handle.
    ///
    /// # Safety
    ///
    /// `raw` must be a handle this caller owns and nothing else will close.
    pub unsafe fn from_raw(raw: HANDLE) -> Self {
        Self(raw)
    }

    /// The raw handle, still owned by this wrapper.
    pub fn as_raw(&self) -> HANDLE {
        self.0
    }

    /// Releases ownership without closing.
    pub fn into_raw(self) -> HANDLE {
        let raw = self.0;
        core::mem::forget(self);
        raw
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != current_process() {
            // SAFETY: we own the handle and this is the only close.
            unsafe { NtClose(self.0) };
        }
    }
}

// SAFETY: a handle value is just a kernel table index; the kernel serializes
// access to the underlying object.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}
