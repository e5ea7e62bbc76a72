//! Callback-driven enumeration over system and process scopes.
//!
//! Every scope shares one shape: the callback sees a single record at a time
//! and answers with [`Walk`]. `Stop` means the callback accepted the record
//! and the scan halts there; `Continue` moves on to the next record. A scan
//! over a scope that holds no records at all reports `NotFound` without ever
//! invoking the callback.

use crate::error::{Result, SpecterError};

#[cfg(windows)]
use {
    crate::error::{nt_success, STATUS_NO_MORE_ENTRIES},
    crate::query::{
        self, grown_capacity, is_size_signal, QueryBuffer, SystemInformationClass,
    },
    crate::utils::{self, handle::Handle, strings},
    core::mem,
    ntapi::ntexapi::{
        RTL_PROCESS_MODULES, RTL_PROCESS_MODULE_INFORMATION, SYSTEM_EXTENDED_THREAD_INFORMATION,
        SYSTEM_PROCESS_INFORMATION, SYSTEM_THREAD_INFORMATION,
    },
    ntapi::ntobapi::{NtOpenDirectoryObject, NtQueryDirectoryObject, DIRECTORY_QUERY, OBJECT_DIRECTORY_INFORMATION},
    ntapi::ntrtl::RtlInitUnicodeString,
    winapi::shared::ntdef::{HANDLE, OBJ_CASE_INSENSITIVE, UNICODE_STRING},
};

/// Control decision returned by an enumeration callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Keep scanning.
    Continue,
    /// The callback accepted this record; halt the scan.
    Stop,
}

/// How a scan finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// A callback accepted a record before the scope was exhausted.
    Stopped,
    /// Every record was visited without the callback stopping the scan.
    Completed,
}

/// Walks records chained by a little-endian u32 byte delta stored at the
/// start of each record. A zero delta marks the final record, which is still
/// visited before the walk ends.
pub(crate) fn walk_delta_chain<F>(buffer: &[u8], mut visit: F) -> Result<WalkOutcome>
where
    F: FnMut(&[u8]) -> Walk,
{
    if buffer.len() < 4 {
        return Err(SpecterError::NotFound);
    }

    let mut offset = 0usize;
    loop {
        let header = buffer.get(offset..offset + 4).ok_or(SpecterError::Unsuccessful)?;
        let delta = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if delta != 0 && delta < 4 {
            return Err(SpecterError::Unsuccessful);
        }

        let end = if delta == 0 {
            buffer.len()
        } else {
            offset.checked_add(delta).ok_or(SpecterError::Unsuccessful)?
        };
        let record = buffer.get(offset..end).ok_or(SpecterError::Unsuccessful)?;

        if visit(record) == Walk::Stop {
            return Ok(WalkOutcome::Stopped);
        }
        if delta == 0 {
            return Ok(WalkOutcome::Completed);
        }
        offset += delta;
    }
}

/// One loaded kernel module, viewed inside the query buffer.
#[cfg(windows)]
pub struct SystemModule<'a> {
    raw: &'a RTL_PROCESS_MODULE_INFORMATION,
}

#[cfg(windows)]
impl SystemModule<'_> {
    pub fn image_base(&self) -> u64 {
        self.raw.ImageBase as u64
    }

    pub fn image_size(&self) -> u32 {
        self.raw.ImageSize
    }

    pub fn load_order_index(&self) -> u16 {
        self.raw.LoadOrderIndex
    }

    /// Full NT path of the module image, e.g. `\SystemRoot\system32\ntoskrnl.exe`.
    pub fn full_path(&self) -> String {
        String::from_utf8_lossy(self.path_bytes()).into_owned()
    }

    /// File-name portion of the path.
    pub fn file_name(&self) -> String {
        String::from_utf8_lossy(self.file_name_bytes()).into_owned()
    }

    pub(crate) fn path_bytes(&self) -> &[u8] {
        let path = &self.raw.FullPathName[..];
        let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
        &path[..end]
    }

    pub(crate) fn file_name_bytes(&self) -> &[u8] {
        let path = self.path_bytes();
        let offset = (self.raw.OffsetToFileName as usize).min(path.len());
        &path[offset..]
    }

    /// Copies the descriptor out of the query buffer.
    pub fn to_owned(&self) -> SystemModuleInfo {
        SystemModuleInfo {
            image_base: self.image_base(),
            image_size: self.image_size(),
            load_order_index: self.load_order_index(),
            full_path: self.full_path(),
            file_name: self.file_name(),
        }
    }
}

/// Owned copy of a kernel module descriptor.
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct SystemModuleInfo {
    pub image_base: u64,
    pub image_size: u32,
    pub load_order_index: u16,
    pub full_path: String,
    pub file_name: String,
}

/// Enumerates loaded kernel modules.
///
/// # Arguments
///
/// * `callback` - Invoked per module; returning [`Walk::Stop`] halts the scan.
///
/// # Returns
///
/// * `Ok(WalkOutcome)` - Whether the callback stopped the scan or it ran out.
/// * `Err(SpecterError)` - The query failed or the module list was empty.
#[cfg(windows)]
pub fn enumerate_system_modules<F>(mut callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&SystemModule<'_>) -> Walk,
{
    let buffer = query::query_system_information(SystemInformationClass::Modules)?;
    // SAFETY: SystemModuleInformation fills the buffer with RTL_PROCESS_MODULES.
    let modules: &RTL_PROCESS_MODULES = unsafe { buffer.view()? };

    let count = modules.NumberOfModules as usize;
    if count == 0 {
        return Err(SpecterError::NotFound);
    }

    let table_offset = mem::offset_of!(RTL_PROCESS_MODULES, Modules);
    let table_end = table_offset + count * mem::size_of::<RTL_PROCESS_MODULE_INFORMATION>();
    if table_end > buffer.len() {
        return Err(SpecterError::Unsuccessful);
    }

    for index in 0..count {
        // SAFETY: index stays inside the bounds checked above.
        let raw = unsafe { &*modules.Modules.as_ptr().add(index) };
        if callback(&SystemModule { raw }) == Walk::Stop {
            return Ok(WalkOutcome::Stopped);
        }
    }

    Ok(WalkOutcome::Completed)
}

/// Looks up a kernel module descriptor by file name (case-sensitive match
/// against the file-name portion of each module's path).
#[cfg(windows)]
pub fn find_system_module(file_name: &str) -> Result<SystemModuleInfo> {
    if file_name.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let mut found = None;
    let outcome = enumerate_system_modules(|module| {
        if module.file_name_bytes() == file_name.as_bytes() {
            found = Some(module.to_owned());
            Walk::Stop
        } else {
            Walk::Continue
        }
    })?;

    match (outcome, found) {
        (WalkOutcome::Stopped, Some(info)) => Ok(info),
        _ => Err(SpecterError::NotFound),
    }
}

/// One running process, viewed inside the query buffer.
#[cfg(windows)]
pub struct ProcessRecord<'a> {
    raw: &'a SYSTEM_PROCESS_INFORMATION,
    record: &'a [u8],
}

#[cfg(windows)]
impl<'a> ProcessRecord<'a> {
    pub fn pid(&self) -> u32 {
        self.raw.UniqueProcessId as usize as u32
    }

    pub fn parent_pid(&self) -> u32 {
        self.raw.InheritedFromUniqueProcessId as usize as u32
    }

    pub fn session_id(&self) -> u32 {
        self.raw.SessionId
    }

    pub fn handle_count(&self) -> u32 {
        self.raw.HandleCount
    }

    pub fn thread_count(&self) -> u32 {
        self.raw.NumberOfThreads
    }

    /// Image file name without path; empty for the idle/system entries.
    pub fn image_name(&self) -> String {
        // SAFETY: the name buffer points into the same query buffer as the record.
        unsafe { strings::from_unicode_string(&self.raw.ImageName) }
    }

    /// Extended thread record at `index`, bounds-checked against both the
    /// thread count and the record extent.
    pub fn thread(&self, index: usize) -> Option<ThreadRecord<'a>> {
        if index >= self.raw.NumberOfThreads as usize {
            return None;
        }

        let table_offset = mem::size_of::<SYSTEM_PROCESS_INFORMATION>()
            - mem::size_of::<SYSTEM_THREAD_INFORMATION>();
        let entry_offset =
            table_offset + index * mem::size_of::<SYSTEM_EXTENDED_THREAD_INFORMATION>();
        if entry_offset + mem::size_of::<SYSTEM_EXTENDED_THREAD_INFORMATION>() > self.record.len() {
            return None;
        }

        // SAFETY: the offset was checked against the record slice just above.
        let raw = unsafe {
            &*self
                .record
                .as_ptr()
                .add(entry_offset)
                .cast::<SYSTEM_EXTENDED_THREAD_INFORMATION>()
        };
        Some(ThreadRecord { raw })
    }
}

/// One thread of a process, viewed inside the query buffer.
#[cfg(windows)]
pub struct ThreadRecord<'a> {
    raw: &'a SYSTEM_EXTENDED_THREAD_INFORMATION,
}

#[cfg(windows)]
impl ThreadRecord<'_> {
    pub fn thread_id(&self) -> u32 {
        self.raw.ThreadInfo.ClientId.UniqueThread as usize as u32
    }

    pub fn start_address(&self) -> u64 {
        self.raw.ThreadInfo.StartAddress as u64
    }

    pub fn win32_start_address(&self) -> u64 {
        self.raw.Win32StartAddress as u64
    }

    pub fn teb_base(&self) -> u64 {
        self.raw.TebBase as u64
    }

    pub fn priority(&self) -> i32 {
        self.raw.ThreadInfo.Priority
    }
}

/// Enumerates running processes.
///
/// Records are chained by byte deltas inside one snapshot buffer; the final
/// record carries a zero delta and is visited like any other.
#[cfg(windows)]
pub fn enumerate_processes<F>(mut callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&ProcessRecord<'_>) -> Walk,
{
    let buffer = query::query_system_information(SystemInformationClass::Processes)?;
    let bytes = buffer.as_bytes();

    let mut malformed = false;
    let outcome = walk_delta_chain(bytes, |record| {
        if record.len() < mem::size_of::<SYSTEM_PROCESS_INFORMATION>() {
            malformed = true;
            return Walk::Stop;
        }
        // SAFETY: the record slice is large enough and the snapshot buffer is
        // 8-byte aligned with kernel-aligned deltas.
        let raw = unsafe { &*record.as_ptr().cast::<SYSTEM_PROCESS_INFORMATION>() };
        callback(&ProcessRecord { raw, record })
    })?;

    if malformed {
        return Err(SpecterError::Unsuccessful);
    }
    Ok(outcome)
}

/// Enumerates the threads of the process identified by `pid`.
///
/// Built on the process scan: the outer walk short-circuits at the target
/// process, and a `pid` that appears nowhere in the snapshot reports
/// `NotFound`.
#[cfg(windows)]
pub fn enumerate_process_threads<F>(pid: u32, mut callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&ThreadRecord<'_>) -> Walk,
{
    let mut stopped = false;
    let outcome = enumerate_processes(|process| {
        if process.pid() != pid {
            return Walk::Continue;
        }
        for index in 0..process.thread_count() as usize {
            let Some(thread) = process.thread(index) else {
                break;
            };
            if callback(&thread) == Walk::Stop {
                stopped = true;
                break;
            }
        }
        // Target located; the outer scan has nothing further to visit.
        Walk::Stop
    })?;

    match outcome {
        WalkOutcome::Stopped if stopped => Ok(WalkOutcome::Stopped),
        WalkOutcome::Stopped => Ok(WalkOutcome::Completed),
        WalkOutcome::Completed => Err(SpecterError::NotFound),
    }
}

/// One entry of an object manager directory.
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub type_name: String,
}

/// Enumerates the object manager namespace under `root` (e.g. `\Driver`).
///
/// Entries are fetched one at a time through a directory handle; the paging
/// cursor lives in the handle, so resizing the transfer buffer mid-scan never
/// skips or repeats an entry. The handle is released on every exit path.
#[cfg(windows)]
pub fn enumerate_directory_objects<F>(root: &str, mut callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&DirectoryEntry) -> Walk,
{
    if root.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }

    let wide = strings::to_wide(root);
    let mut name: UNICODE_STRING = unsafe { mem::zeroed() };
    // SAFETY: `wide` is NUL-terminated and outlives the directory open below.
    unsafe { RtlInitUnicodeString(&mut name, wide.as_ptr()) };
    let mut attributes = utils::object_attributes(&mut name, OBJ_CASE_INSENSITIVE);

    let mut raw: HANDLE = core::ptr::null_mut();
    // SAFETY: all out-pointers are valid for the duration of the call.
    let status = unsafe { NtOpenDirectoryObject(&mut raw, DIRECTORY_QUERY, &mut attributes) };
    if !nt_success(status) || raw.is_null() {
        return Err(SpecterError::from_status("NtOpenDirectoryObject", status));
    }
    // SAFETY: the handle was just opened by us and is owned from here on.
    let directory = unsafe { Handle::from_raw(raw) };

    let mut context = 0u32;
    let mut capacity = 0x100usize;
    let mut visited = 0usize;

    loop {
        let mut buffer = QueryBuffer::with_len(capacity);
        let mut reported = 0u32;
        // SAFETY: buffer and out-pointers stay alive across the call.
        let status = unsafe {
            NtQueryDirectoryObject(
                directory.as_raw(),
                buffer.as_mut_bytes().as_mut_ptr().cast(),
                buffer.len() as u32,
                1, // one entry per call; the context cursor tracks position
                0,
                &mut context,
                &mut reported,
            )
        };

        if status == STATUS_NO_MORE_ENTRIES {
            break;
        }
        if is_size_signal(status) {
            capacity = grown_capacity(capacity, reported as usize);
            continue;
        }
        if !nt_success(status) {
            return Err(SpecterError::from_status("NtQueryDirectoryObject", status));
        }

        // SAFETY: a successful single-entry query fills the buffer with one
        // OBJECT_DIRECTORY_INFORMATION whose strings point into that buffer.
        let info: &OBJECT_DIRECTORY_INFORMATION = unsafe { buffer.view()? };
        let entry = DirectoryEntry {
            name: unsafe { strings::from_unicode_string(&info.Name) },
            type_name: unsafe { strings::from_unicode_string(&info.TypeName) },
        };

        visited += 1;
        if callback(&entry) == Walk::Stop {
            return Ok(WalkOutcome::Stopped);
        }
    }

    if visited == 0 {
        Err(SpecterError::NotFound)
    } else {
        Ok(WalkOutcome::Completed)
    }
}

/// Checks whether a named object exists under `root`, ignoring case.
#[cfg(windows)]
pub fn object_exists(root: &str, name: &str) -> Result<bool> {
    if root.is_empty() {
        return Err(SpecterError::InvalidParameter(1));
    }
    if name.is_empty() {
        return Err(SpecterError::InvalidParameter(2));
    }

    match enumerate_directory_objects(root, |entry| {
        if strings::eq_ignore_case(&entry.name, name) {
            Walk::Stop
        } else {
            Walk::Continue
        }
    }) {
        Ok(WalkOutcome::Stopped) => Ok(true),
        Ok(WalkOutcome::Completed) | Err(SpecterError::NotFound) => Ok(false),
        Err(error) => Err(error),
    }
}
