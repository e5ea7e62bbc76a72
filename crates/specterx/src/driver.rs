//! Kernel driver service lifecycle: register, start, device open, stop,
//! delete.
//!
//! `load_driver` is idempotent with respect to stale prior state: any
//! registration already sitting under the target name is deleted before the
//! new one is created. Later steps deliberately do not roll back earlier
//! ones; a caller that wants cleanup after a partial failure calls
//! `unload_driver` itself.

use core::{mem, ptr};

use log::debug;

use windows_sys::Win32::Foundation::{
    GetLastError, GENERIC_READ, GENERIC_WRITE, INVALID_HANDLE_VALUE,
    ERROR_DEPENDENT_SERVICES_RUNNING, ERROR_SERVICE_ALREADY_RUNNING, ERROR_SERVICE_NOT_ACTIVE,
};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING};
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ControlService, CreateServiceW, DeleteService, OpenSCManagerW,
    OpenServiceW, StartServiceW, SC_HANDLE, SC_MANAGER_ALL_ACCESS, SERVICE_ALL_ACCESS,
    SERVICE_CONTROL_STOP, SERVICE_DEMAND_START, SERVICE_ERROR_NORMAL, SERVICE_KERNEL_DRIVER,
    SERVICE_STATUS,
};
use windows_sys::Win32::System::Threading::Sleep;

use winapi::um::winnt::DELETE;

use crate::error::{Result, SpecterError};
use crate::utils::{handle::Handle, strings};

const STOP_RETRY_ATTEMPTS: u32 = 5;
const STOP_RETRY_DELAY_MS: u32 = 1000;

/// Owned service-manager or service handle.
struct ScHandle(SC_HANDLE);

impl ScHandle {
    fn as_raw(&self) -> SC_HANDLE {
        self.0
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the handle was opened by this module and not closed since.
            unsafe { CloseServiceHandle(self.0) };
        }
    }
}

/// Registers, starts, and opens the device of a kernel driver.
///
/// # Arguments
///
/// * `driver_name` - Service and device name.
/// * `driver_path` - Full path of the driver image on disk.
///
/// # Returns
///
/// * `Ok(Handle)` - Handle to `\\.\<driver_name>`.
/// * `Err(SpecterError)` - The first failing step's status. Steps that
///   already completed are left in place.
pub fn load_driver(driver_name: &str, driver_path: &str) -> Result<Handle> {
    if driver_name.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }
    if driver_path.is_empty() {
        return Err(SpecterError::InvalidParameter(2));
    }

    let manager = open_service_manager()?;

    // A stale registration under this name would make the create fail, so it
    // goes first; a missing one is not an error.
    let _ = delete_service(&manager, driver_name);

    create_service(&manager, driver_name, driver_path)?;
    debug!("registered driver service {driver_name} at {driver_path}");

    start_driver(&manager, driver_name)?;
    debug!("driver service {driver_name} is running");

    open_device(driver_name)
}

/// Stops and deletes a previously registered kernel driver service.
///
/// Stopping retries for a bounded time while dependent services are still
/// shutting down; any other stop failure aborts immediately. A name that was
/// never registered reports a not-found-class status without retrying.
pub fn unload_driver(driver_name: &str) -> Result<()> {
    if driver_name.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let manager = open_service_manager()?;
    stop_driver(&manager, driver_name)?;
    debug!("driver service {driver_name} stopped");
    delete_service(&manager, driver_name)
}

fn open_service_manager() -> Result<ScHandle> {
    // SAFETY: null machine and database select the local active database.
    let raw = unsafe { OpenSCManagerW(ptr::null(), ptr::null(), SC_MANAGER_ALL_ACCESS) };
    if raw.is_null() {
        return Err(SpecterError::last_error("OpenSCManagerW"));
    }
    Ok(ScHandle(raw))
}

fn open_service(manager: &ScHandle, name: &str, desired_access: u32) -> Result<ScHandle> {
    let wide = strings::to_wide(name);
    // SAFETY: the name is NUL-terminated and outlives the call.
    let raw = unsafe { OpenServiceW(manager.as_raw(), wide.as_ptr(), desired_access) };
    if raw.is_null() {
        return Err(SpecterError::last_error("OpenServiceW"));
    }
    Ok(ScHandle(raw))
}

fn create_service(manager: &ScHandle, name: &str, path: &str) -> Result<()> {
    let wide_name = strings::to_wide(name);
    let wide_path = strings::to_wide(path);

    // SAFETY: all strings are NUL-terminated and outlive the call.
    let raw = unsafe {
        CreateServiceW(
            manager.as_raw(),
            wide_name.as_ptr(),
            wide_name.as_ptr(),
            SERVICE_ALL_ACCESS,
            SERVICE_KERNEL_DRIVER,
            SERVICE_DEMAND_START,
            SERVICE_ERROR_NORMAL,
            wide_path.as_ptr(),
            ptr::null(),
            ptr::null_mut(),
            ptr::null(),
            ptr::null(),
            ptr::null(),
        )
    };
    if raw.is_null() {
        return Err(SpecterError::last_error("CreateServiceW"));
    }
    drop(ScHandle(raw));
    Ok(())
}

fn start_driver(manager: &ScHandle, name: &str) -> Result<()> {
    let service = open_service(manager, name, SERVICE_ALL_ACCESS)?;

    // SAFETY: a demand-start driver takes no arguments.
    if unsafe { StartServiceW(service.as_raw(), 0, ptr::null()) } == 0 {
        // SAFETY: GetLastError only reads thread-local state.
        let error = unsafe { GetLastError() };
        if error != ERROR_SERVICE_ALREADY_RUNNING {
            return Err(SpecterError::from_win32("StartServiceW", error));
        }
    }
    Ok(())
}

fn stop_driver(manager: &ScHandle, name: &str) -> Result<()> {
    let service = open_service(manager, name, SERVICE_ALL_ACCESS)?;
    let mut status: SERVICE_STATUS = unsafe { mem::zeroed() };

    for _ in 0..STOP_RETRY_ATTEMPTS {
        // SAFETY: the status struct lives across the call.
        if unsafe { ControlService(service.as_raw(), SERVICE_CONTROL_STOP, &mut status) } != 0 {
            return Ok(());
        }

        // SAFETY: GetLastError only reads thread-local state.
        let error = unsafe { GetLastError() };
        if error == ERROR_SERVICE_NOT_ACTIVE {
            return Ok(());
        }
        if error != ERROR_DEPENDENT_SERVICES_RUNNING {
            return Err(SpecterError::from_win32("ControlService", error));
        }

        debug!("dependent services of {name} still running, retrying stop");
        // SAFETY: plain bounded delay.
        unsafe { Sleep(STOP_RETRY_DELAY_MS) };
    }

    Err(SpecterError::from_win32(
        "ControlService",
        ERROR_DEPENDENT_SERVICES_RUNNING,
    ))
}

fn delete_service(manager: &ScHandle, name: &str) -> Result<()> {
    let service = open_service(manager, name, DELETE)?;
    // SAFETY: deletion is marked on the open handle.
    if unsafe { DeleteService(service.as_raw()) } == 0 {
        return Err(SpecterError::last_error("DeleteService"));
    }
    Ok(())
}

fn open_device(driver_name: &str) -> Result<Handle> {
    let wide = strings::to_wide(&format!("\\\\.\\{driver_name}"));
    // SAFETY: the device path is NUL-terminated and outlives the call.
    let raw = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            ptr::null_mut(),
        )
    };
    if raw == INVALID_HANDLE_VALUE {
        return Err(SpecterError::last_error("CreateFileW"));
    }
    debug!("opened device \\\\.\\{driver_name}");
    // SAFETY: the handle was just opened by us.
    Ok(unsafe { Handle::from_raw(raw.cast()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_are_rejected_before_touching_the_service_database() {
        assert_eq!(
            load_driver("", "C:\\drv.sys").unwrap_err(),
            SpecterError::InvalidParameter(1)
        );
        assert_eq!(
            load_driver("drv", "").unwrap_err(),
            SpecterError::InvalidParameter(2)
        );
        assert_eq!(
            unload_driver("").unwrap_err(),
            SpecterError::InvalidParameter(1)
        );
    }
}
