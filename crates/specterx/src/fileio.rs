//! File operations through the native layer, plus path utilities.

use core::{mem, ptr};

use ntapi::ntioapi::{
    FileStandardInformation, NtCreateFile, NtQueryInformationFile, NtWriteFile,
    FILE_OPEN, FILE_STANDARD_INFORMATION, FILE_SYNCHRONOUS_IO_NONALERT, IO_STATUS_BLOCK,
};
use ntapi::ntobapi::{NtOpenSymbolicLinkObject, NtQuerySymbolicLinkObject};
use ntapi::ntrtl::{RtlDosPathNameToNtPathName_U, RtlFreeUnicodeString, RtlInitUnicodeString};
use winapi::shared::ntdef::{HANDLE, OBJ_CASE_INSENSITIVE, UNICODE_STRING};
use winapi::um::winnt::{FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, GENERIC_WRITE};
use windows_sys::Win32::Storage::FileSystem::{
    CopyFileW, GetFullPathNameW, GetLogicalDriveStringsW,
};
use windows_sys::Win32::System::SystemInformation::GetWindowsDirectoryW;

use crate::error::{nt_success, Result, SpecterError};
use crate::utils::path::translate_nt_path;
use crate::utils::{self, handle::Handle, strings};

// Access right for resolving a symbolic link object's target.
const SYMBOLIC_LINK_QUERY: u32 = 0x0001;

/// Opens an existing file by DOS path through the native layer.
///
/// # Arguments
///
/// * `path` - DOS path, converted to its NT form internally.
/// * `desired_access` - FILE_* access mask.
///
/// # Returns
///
/// * `Ok(Handle)` - Owned file handle.
/// * `Err(SpecterError)` - `ObjectNameNotFound` when the path does not
///   convert, otherwise the open status.
pub fn open_file(path: &str, desired_access: u32) -> Result<Handle> {
    if path.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let wide = strings::to_wide(path);
    let mut nt_name: UNICODE_STRING = unsafe { mem::zeroed() };
    // SAFETY: `wide` is NUL-terminated; the converted name is freed below.
    let converted = unsafe {
        RtlDosPathNameToNtPathName_U(wide.as_ptr(), &mut nt_name, ptr::null_mut(), ptr::null_mut())
    };
    if converted == 0 {
        return Err(SpecterError::ObjectNameNotFound);
    }

    let mut attributes = utils::object_attributes(&mut nt_name, OBJ_CASE_INSENSITIVE);
    let mut io_status: IO_STATUS_BLOCK = unsafe { mem::zeroed() };
    let mut raw: HANDLE = ptr::null_mut();

    // SAFETY: every pointer stays valid across the call.
    let status = unsafe {
        NtCreateFile(
            &mut raw,
            desired_access,
            &mut attributes,
            &mut io_status,
            ptr::null_mut(),
            FILE_ATTRIBUTE_NORMAL,
            FILE_SHARE_READ,
            FILE_OPEN,
            FILE_SYNCHRONOUS_IO_NONALERT,
            ptr::null_mut(),
            0,
        )
    };
    // SAFETY: the name buffer was allocated by the path conversion above.
    unsafe { RtlFreeUnicodeString(&mut nt_name) };

    if !nt_success(status) {
        return Err(SpecterError::from_status("NtCreateFile", status));
    }
    // SAFETY: the handle was just opened by us.
    Ok(unsafe { Handle::from_raw(raw) })
}

/// Size in bytes of an open file.
pub fn file_size(file: &Handle) -> Result<u64> {
    let mut io_status: IO_STATUS_BLOCK = unsafe { mem::zeroed() };
    let mut info: FILE_STANDARD_INFORMATION = unsafe { mem::zeroed() };

    // SAFETY: the output struct and status block live across the call.
    let status = unsafe {
        NtQueryInformationFile(
            file.as_raw(),
            &mut io_status,
            (&mut info as *mut FILE_STANDARD_INFORMATION).cast(),
            mem::size_of::<FILE_STANDARD_INFORMATION>() as u32,
            FileStandardInformation,
        )
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtQueryInformationFile", status));
    }
    // SAFETY: LARGE_INTEGER is a plain union; QuadPart covers all of it.
    Ok(unsafe { *info.EndOfFile.QuadPart() } as u64)
}

/// Overwrites the start of an existing file with `data`.
///
/// The write is synchronous and the whole buffer must land; a short write is
/// reported as a failure.
pub fn write_file(path: &str, data: &[u8]) -> Result<()> {
    if path.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let file = open_file(path, GENERIC_WRITE)?;
    let mut io_status: IO_STATUS_BLOCK = unsafe { mem::zeroed() };

    // SAFETY: the data buffer and status block live across the call.
    let status = unsafe {
        NtWriteFile(
            file.as_raw(),
            ptr::null_mut(),
            None,
            ptr::null_mut(),
            &mut io_status,
            data.as_ptr() as *mut _,
            data.len() as u32,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtWriteFile", status));
    }
    if io_status.Information != data.len() {
        return Err(SpecterError::Unsuccessful);
    }
    Ok(())
}

/// Copies a file, replacing any existing destination.
pub fn copy_file(source: &str, destination: &str) -> Result<()> {
    if source.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }
    if destination.is_empty() {
        return Err(SpecterError::InvalidParameter(2));
    }

    let wide_source = strings::to_wide(source);
    let wide_destination = strings::to_wide(destination);
    // SAFETY: both strings are NUL-terminated and outlive the call.
    let copied = unsafe { CopyFileW(wide_source.as_ptr(), wide_destination.as_ptr(), 0) };
    if copied == 0 {
        return Err(SpecterError::last_error("CopyFileW"));
    }
    Ok(())
}

/// Resolves a possibly-relative path to its full form.
pub fn full_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let wide = strings::to_wide(path);
    // SAFETY: a zero-length query only reports the needed size.
    let needed = unsafe { GetFullPathNameW(wide.as_ptr(), 0, ptr::null_mut(), ptr::null_mut()) };
    if needed == 0 {
        return Err(SpecterError::last_error("GetFullPathNameW"));
    }

    let mut buffer = vec![0u16; needed as usize];
    // SAFETY: the buffer was sized by the probe above.
    let written = unsafe {
        GetFullPathNameW(
            wide.as_ptr(),
            buffer.len() as u32,
            buffer.as_mut_ptr(),
            ptr::null_mut(),
        )
    };
    if written == 0 {
        return Err(SpecterError::last_error("GetFullPathNameW"));
    }
    Ok(strings::from_wide(&buffer[..written as usize]))
}

/// Mounted drive letters, each as `X:`.
pub fn mounted_drives() -> Result<Vec<String>> {
    let mut buffer = [0u16; 256];
    // SAFETY: the buffer length is passed along with the buffer.
    let written = unsafe { GetLogicalDriveStringsW(buffer.len() as u32, buffer.as_mut_ptr()) };
    if written == 0 {
        return Err(SpecterError::last_error("GetLogicalDriveStringsW"));
    }

    let drives = buffer[..written as usize]
        .split(|&unit| unit == 0)
        .filter(|entry| entry.len() >= 2)
        .map(|entry| String::from_utf16_lossy(&entry[..2]))
        .collect();
    Ok(drives)
}

/// Resolves a drive letter (`C:`) to its device symbolic link target
/// (`\Device\HarddiskVolume...`).
pub fn drive_device_link(drive: &str) -> Result<String> {
    if drive.len() < 2 {
        return Err(SpecterError::InvalidParameter(1));
    }

    let wide = strings::to_wide(&format!("\\??\\{}", &drive[..2]));
    let mut name: UNICODE_STRING = unsafe { mem::zeroed() };
    // SAFETY: `wide` is NUL-terminated and outlives the open below.
    unsafe { RtlInitUnicodeString(&mut name, wide.as_ptr()) };
    let mut attributes = utils::object_attributes(&mut name, OBJ_CASE_INSENSITIVE);

    let mut raw: HANDLE = ptr::null_mut();
    // SAFETY: all out-pointers are valid for the duration of the call.
    let status = unsafe { NtOpenSymbolicLinkObject(&mut raw, SYMBOLIC_LINK_QUERY, &mut attributes) };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtOpenSymbolicLinkObject", status));
    }
    // SAFETY: the handle was just opened by us.
    let link = unsafe { Handle::from_raw(raw) };

    let mut target_buffer = vec![0u16; 260];
    let mut target = UNICODE_STRING {
        Length: 0,
        MaximumLength: (target_buffer.len() * 2) as u16,
        Buffer: target_buffer.as_mut_ptr(),
    };
    // SAFETY: the target string points at a buffer that outlives the call.
    let status = unsafe { NtQuerySymbolicLinkObject(link.as_raw(), &mut target, ptr::null_mut()) };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtQuerySymbolicLinkObject", status));
    }

    Ok(String::from_utf16_lossy(
        &target_buffer[..(target.Length / 2) as usize],
    ))
}

/// Translates an NT path (`\SystemRoot\...`, `\Device\...`, `\??\...`) into
/// its DOS form.
pub fn dos_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let system_root = windows_directory()?;

    // The drive table is only needed for \Device\ paths and costs a handle
    // per mounted drive, so build it lazily.
    let devices = if crate::utils::path::starts_with_ignore_case(path, "\\Device") {
        mounted_drives()?
            .into_iter()
            .map(|drive| {
                let link = drive_device_link(&drive).unwrap_or_default();
                (drive, link)
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(translate_nt_path(path, &system_root, &devices))
}

fn windows_directory() -> Result<String> {
    let mut buffer = [0u16; 260];
    // SAFETY: the buffer length is passed along with the buffer.
    let written = unsafe { GetWindowsDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32) };
    if written == 0 {
        return Err(SpecterError::last_error("GetWindowsDirectoryW"));
    }
    Ok(strings::from_wide(&buffer[..written as usize]))
}
