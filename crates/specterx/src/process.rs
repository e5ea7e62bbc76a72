//! Process-level primitives: open, terminate, bitness probing, and remote
//! thread creation.

use core::{mem, ptr};

use ntapi::ntapi_base::CLIENT_ID;
use ntapi::ntpsapi::{NtOpenProcess, NtTerminateProcess};
use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
use windows_sys::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, WaitForSingleObject, INFINITE,
};

use winapi::shared::ntdef::HANDLE;

use crate::error::{nt_success, NtStatus, Result, SpecterError};
use crate::query::{self, ProcessInformationClass};
use crate::utils::{self, handle::Handle};

/// Opens a process by identifier.
///
/// # Arguments
///
/// * `pid` - Target process identifier.
/// * `desired_access` - PROCESS_* access mask the handle should carry.
///
/// # Returns
///
/// * `Ok(Handle)` - Owned handle, released when dropped.
/// * `Err(SpecterError)` - The open failed, typically access-denied.
pub fn open_process(pid: u32, desired_access: u32) -> Result<Handle> {
    if pid == 0 {
        return Err(SpecterError::InvalidParameter(1));
    }

    let mut attributes = utils::object_attributes(ptr::null_mut(), 0);
    let mut client_id = CLIENT_ID {
        UniqueProcess: pid as usize as HANDLE,
        UniqueThread: ptr::null_mut(),
    };

    let mut raw: HANDLE = ptr::null_mut();
    // SAFETY: all out-pointers are valid for the duration of the call.
    let status =
        unsafe { NtOpenProcess(&mut raw, desired_access, &mut attributes, &mut client_id) };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtOpenProcess", status));
    }
    // SAFETY: the handle was just opened by us and is owned from here on.
    Ok(unsafe { Handle::from_raw(raw) })
}

/// Terminates the target process with the given exit status.
pub fn terminate_process(process: HANDLE, exit_status: NtStatus) -> Result<()> {
    // SAFETY: the caller supplies a handle with terminate access.
    let status = unsafe { NtTerminateProcess(process, exit_status) };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtTerminateProcess", status));
    }
    Ok(())
}

/// Whether the target runs under the 32-bit compatibility subsystem.
///
/// Returns the address of the target's 32-bit environment block when it does,
/// `None` for a native process.
pub fn process_is_wow64(process: HANDLE) -> Result<Option<u64>> {
    let info = query::query_process_information(process, ProcessInformationClass::Wow64)?;
    // SAFETY: ProcessWow64Information fills the buffer with a pointer-sized value.
    let wow64_peb: &usize = unsafe { info.view()? };

    Ok(if *wow64_peb == 0 {
        None
    } else {
        Some(*wow64_peb as u64)
    })
}

/// Creates a thread in the target process at `start_address`.
///
/// With `wait` the call blocks until the thread finishes and returns its exit
/// code; otherwise it returns immediately with `None`. The thread handle is
/// released either way.
pub fn create_thread(
    process: HANDLE,
    start_address: u64,
    parameter: u64,
    wait: bool,
) -> Result<Option<u32>> {
    if start_address == 0 {
        return Err(SpecterError::InvalidParameter(2));
    }

    // SAFETY: a nonzero address transmutes into a valid fn-pointer option.
    let start = unsafe {
        Some(mem::transmute::<
            usize,
            unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
        >(start_address as usize))
    };

    // SAFETY: the parameter is passed through to the new thread untouched.
    let raw = unsafe {
        CreateRemoteThread(
            process.cast(),
            ptr::null(),
            0,
            start,
            parameter as *const core::ffi::c_void,
            0,
            ptr::null_mut(),
        )
    };
    if raw.is_null() {
        return Err(SpecterError::last_error("CreateRemoteThread"));
    }
    // SAFETY: the thread handle was just created by us.
    let thread = unsafe { Handle::from_raw(raw.cast()) };

    if !wait {
        return Ok(None);
    }

    // SAFETY: the owned handle stays valid across the wait.
    if unsafe { WaitForSingleObject(thread.as_raw().cast(), INFINITE) } != WAIT_OBJECT_0 {
        return Err(SpecterError::last_error("WaitForSingleObject"));
    }

    let mut exit_code = 0u32;
    // SAFETY: the owned handle stays valid across the query.
    if unsafe { GetExitCodeThread(thread.as_raw().cast(), &mut exit_code) } == 0 {
        return Err(SpecterError::last_error("GetExitCodeThread"));
    }
    Ok(Some(exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::handle::current_process;

    #[test]
    fn pid_zero_is_rejected_before_any_call() {
        let result = open_process(0, 0x1000);
        assert_eq!(result.unwrap_err(), SpecterError::InvalidParameter(1));
    }

    #[test]
    fn a_null_start_address_is_rejected() {
        let result = create_thread(current_process(), 0, 0, false);
        assert_eq!(result.unwrap_err(), SpecterError::InvalidParameter(2));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn our_own_process_is_not_wow64() {
        let wow64 = process_is_wow64(current_process()).expect("query should succeed");
        assert!(wow64.is_none());
    }
}
