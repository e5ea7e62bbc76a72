//! Virtual memory primitives against a target process.
//!
//! All operations report status instead of panicking, and none of them model
//! partial transfers: either the full requested extent moved or the call
//! failed. Reads and writes against the calling process short-circuit to a
//! direct copy instead of taking the system call round trip.

use core::ptr;

use ntapi::ntmmapi::{
    NtAllocateVirtualMemory, NtFreeVirtualMemory, NtProtectVirtualMemory, NtReadVirtualMemory,
    NtWriteVirtualMemory,
};
use winapi::shared::ntdef::{HANDLE, PVOID};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::error::{nt_success, Result, SpecterError};

fn is_current_process(process: HANDLE) -> bool {
    // SAFETY: GetCurrentProcess returns a constant pseudo handle.
    ptr::eq(process.cast(), unsafe { GetCurrentProcess() })
}

/// Reads `buffer.len()` bytes from `address` in the target process.
///
/// # Arguments
///
/// * `process` - Handle with read access, or the current-process pseudo handle.
/// * `address` - Start of the range in the target's address space.
/// * `buffer` - Receives the bytes; filled completely or not at all.
pub fn read_process_memory(process: HANDLE, address: u64, buffer: &mut [u8]) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    if is_current_process(process) {
        // SAFETY: the caller vouches for the source range, exactly as it
        // would have to for the cross-process path.
        unsafe {
            ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len());
        }
        return Ok(());
    }

    let mut transferred = 0usize;
    // SAFETY: the output buffer lives across the call and its length is passed.
    let status = unsafe {
        NtReadVirtualMemory(
            process,
            address as PVOID,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            &mut transferred,
        )
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtReadVirtualMemory", status));
    }
    if transferred != buffer.len() {
        return Err(SpecterError::Unsuccessful);
    }
    Ok(())
}

/// Writes `data` to `address` in the target process.
pub fn write_process_memory(process: HANDLE, address: u64, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    if is_current_process(process) {
        // SAFETY: the caller vouches for the destination range.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }
        return Ok(());
    }

    let mut transferred = 0usize;
    // SAFETY: the input buffer lives across the call and its length is passed.
    let status = unsafe {
        NtWriteVirtualMemory(
            process,
            address as PVOID,
            data.as_ptr() as PVOID,
            data.len(),
            &mut transferred,
        )
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtWriteVirtualMemory", status));
    }
    if transferred != data.len() {
        return Err(SpecterError::Unsuccessful);
    }
    Ok(())
}

/// Reserves and/or commits a region in the target process.
///
/// # Arguments
///
/// * `preferred` - Requested base address, or zero to let the kernel choose.
/// * `allocation_type` - MEM_* flags, e.g. `MEM_RESERVE | MEM_COMMIT`.
/// * `protection` - Initial PAGE_* protection.
///
/// # Returns
///
/// The actual base address and the (page-rounded) size of the region.
pub fn allocate_virtual_memory(
    process: HANDLE,
    preferred: u64,
    size: usize,
    allocation_type: u32,
    protection: u32,
) -> Result<(u64, usize)> {
    if size == 0 {
        return Err(SpecterError::InvalidParameter(3));
    }

    let mut base = preferred as PVOID;
    let mut region = size;
    // SAFETY: base and region are in-out parameters owned by this frame.
    let status = unsafe {
        NtAllocateVirtualMemory(process, &mut base, 0, &mut region, allocation_type, protection)
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtAllocateVirtualMemory", status));
    }
    Ok((base as u64, region))
}

/// Changes the protection of a region and returns the previous protection.
pub fn protect_virtual_memory(
    process: HANDLE,
    address: u64,
    size: usize,
    protection: u32,
) -> Result<u32> {
    if size == 0 {
        return Err(SpecterError::InvalidParameter(3));
    }

    let mut base = address as PVOID;
    let mut region = size;
    let mut old_protection = 0u32;
    // SAFETY: all in-out parameters are owned by this frame.
    let status = unsafe {
        NtProtectVirtualMemory(process, &mut base, &mut region, protection, &mut old_protection)
    };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtProtectVirtualMemory", status));
    }
    Ok(old_protection)
}

/// Releases or decommits a region in the target process.
///
/// With `MEM_RELEASE` the kernel requires `size` zero and frees the whole
/// allocation that `address` belongs to.
pub fn free_virtual_memory(
    process: HANDLE,
    address: u64,
    size: usize,
    free_type: u32,
) -> Result<()> {
    let mut base = address as PVOID;
    let mut region = size;
    // SAFETY: all in-out parameters are owned by this frame.
    let status = unsafe { NtFreeVirtualMemory(process, &mut base, &mut region, free_type) };
    if !nt_success(status) {
        return Err(SpecterError::from_status("NtFreeVirtualMemory", status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::handle::current_process;

    #[test]
    fn same_process_reads_take_the_direct_path() {
        let source = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let mut sink = [0u8; 4];
        read_process_memory(current_process(), source.as_ptr() as u64, &mut sink)
            .expect("in-process read should succeed");
        assert_eq!(sink, source);
    }

    #[test]
    fn same_process_writes_take_the_direct_path() {
        let mut sink = [0u8; 4];
        let data = [1u8, 2, 3, 4];
        write_process_memory(current_process(), sink.as_mut_ptr() as u64, &data)
            .expect("in-process write should succeed");
        assert_eq!(sink, data);
    }

    #[test]
    fn empty_transfers_are_trivially_complete() {
        let mut empty = [0u8; 0];
        read_process_memory(current_process(), 0, &mut empty).expect("empty read");
        write_process_memory(current_process(), 0, &empty).expect("empty write");
    }

    #[test]
    fn zero_sized_allocations_are_rejected_up_front() {
        use windows_sys::Win32::System::Memory::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        let result = allocate_virtual_memory(
            current_process(),
            0,
            0,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        );
        assert_eq!(result.unwrap_err(), SpecterError::InvalidParameter(3));
    }

    #[test]
    fn allocate_protect_free_round_trips_in_our_own_process() {
        use windows_sys::Win32::System::Memory::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READONLY, PAGE_READWRITE,
        };

        let (base, size) = allocate_virtual_memory(
            current_process(),
            0,
            0x1000,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
        .expect("allocation should succeed");
        assert_ne!(base, 0);
        assert!(size >= 0x1000);

        write_process_memory(current_process(), base, &[7u8; 16]).expect("write");
        let mut read_back = [0u8; 16];
        read_process_memory(current_process(), base, &mut read_back).expect("read");
        assert_eq!(read_back, [7u8; 16]);

        let old = protect_virtual_memory(current_process(), base, size, PAGE_READONLY)
            .expect("protection change should succeed");
        assert_eq!(old, PAGE_READWRITE);

        free_virtual_memory(current_process(), base, 0, MEM_RELEASE)
            .expect("release should succeed");
    }
}
