//! Walks the loader bookkeeping of a foreign process to list its modules.
//!
//! The list is a doubly linked chain embedded in the target's own memory,
//! reached through the environment block. Every node is copied out by value
//! and only the freshly copied forward link is followed; nothing in the
//! foreign address space is ever dereferenced in place. WOW64 targets keep an
//! independent, narrower copy of the same structures, handled by the same
//! walk through [`LoaderView::Compat32`].

use log::trace;
use zerocopy::FromBytes;

use crate::data::loader::{
    LdrEntry32, LdrEntry64, PebLdr32, PebLdr64, PEB32_LDR_OFFSET, PEB64_LDR_OFFSET,
};
use crate::enumerate::{Walk, WalkOutcome};
use crate::error::{Result, SpecterError};

#[cfg(windows)]
use {
    crate::memory,
    crate::query::{self, ProcessInformationClass},
    ntapi::ntpsapi::PROCESS_BASIC_INFORMATION,
    winapi::shared::ntdef::HANDLE,
};

/// Reads raw bytes out of some address space.
pub trait MemorySource {
    /// Fills `buffer` from `address`, or fails; partial reads are failures.
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()>;
}

/// Which loader structure width a target process uses.
///
/// Selected once per target; the walk itself is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderView {
    /// Native-bitness structures.
    Native,
    /// The 32-bit copies maintained for a WOW64 process.
    Compat32,
}

impl LoaderView {
    fn peb_ldr_offset(self) -> u64 {
        match self {
            Self::Native => PEB64_LDR_OFFSET,
            Self::Compat32 => PEB32_LDR_OFFSET,
        }
    }

    fn pointer_width(self) -> usize {
        match self {
            Self::Native => 8,
            Self::Compat32 => 4,
        }
    }

    fn list_head_offset(self) -> u64 {
        match self {
            Self::Native => core::mem::offset_of!(PebLdr64, in_load_order_module_list) as u64,
            Self::Compat32 => core::mem::offset_of!(PebLdr32, in_load_order_module_list) as u64,
        }
    }

    fn load_order_links_offset(self) -> u64 {
        match self {
            Self::Native => core::mem::offset_of!(LdrEntry64, in_load_order_links) as u64,
            Self::Compat32 => core::mem::offset_of!(LdrEntry32, in_load_order_links) as u64,
        }
    }
}

/// Snapshot of one module of a foreign process.
#[derive(Debug, Clone)]
pub struct ForeignModule {
    pub dll_base: u64,
    pub entry_point: u64,
    pub size_of_image: u32,
    /// Full DLL path as recorded by the target's loader; empty when the name
    /// could not be read back out of the target.
    pub full_name: String,
}

// A legitimate module list never gets near this; hitting it means the chain
// is corrupted or circular without its sentinel.
const MAX_FOREIGN_MODULES: usize = 4096;

fn read_pointer<M: MemorySource>(memory: &M, address: u64, view: LoaderView) -> Result<u64> {
    let mut bytes = [0u8; 8];
    let width = view.pointer_width();
    memory.read_exact(address, &mut bytes[..width])?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_struct<T: FromBytes, M: MemorySource>(memory: &M, address: u64) -> Result<T> {
    let mut bytes = vec![0u8; core::mem::size_of::<T>()];
    memory.read_exact(address, &mut bytes)?;
    T::read_from_bytes(&bytes).map_err(|_| SpecterError::Unsuccessful)
}

/// Reads a UTF-16 name string out of the target. Name strings are advisory,
/// so a failed read degrades to an empty name instead of ending the walk.
fn read_foreign_name<M: MemorySource>(memory: &M, buffer: u64, length_bytes: u16) -> String {
    let length = (length_bytes as usize) & !1;
    if buffer == 0 || length == 0 {
        return String::new();
    }

    let mut raw = vec![0u8; length];
    if memory.read_exact(buffer, &mut raw).is_err() {
        trace!("module name at {buffer:#x} was unreadable");
        return String::new();
    }

    let wide: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&wide)
}

fn snapshot_native<M: MemorySource>(memory: &M, entry: &LdrEntry64) -> Option<ForeignModule> {
    if entry.dll_base == 0 {
        return None;
    }
    Some(ForeignModule {
        dll_base: entry.dll_base,
        entry_point: entry.entry_point,
        size_of_image: entry.size_of_image,
        full_name: read_foreign_name(memory, entry.full_dll_name.buffer, entry.full_dll_name.length),
    })
}

fn snapshot_compat<M: MemorySource>(memory: &M, entry: &LdrEntry32) -> Option<ForeignModule> {
    if entry.dll_base == 0 {
        return None;
    }
    Some(ForeignModule {
        dll_base: entry.dll_base as u64,
        entry_point: entry.entry_point as u64,
        size_of_image: entry.size_of_image,
        full_name: read_foreign_name(
            memory,
            entry.full_dll_name.buffer as u64,
            entry.full_dll_name.length,
        ),
    })
}

/// Walks the module list reachable from the environment block at `peb`.
///
/// The sentinel is the address of the list head field itself; the walk ends
/// when a forward link points back at it. Placeholder nodes with a zero base
/// address are skipped without a callback. A loader that has not finished
/// initializing reports `Unsuccessful`.
pub fn walk_foreign_modules<M, F>(
    memory: &M,
    peb: u64,
    view: LoaderView,
    mut callback: F,
) -> Result<WalkOutcome>
where
    M: MemorySource,
    F: FnMut(&ForeignModule) -> Walk,
{
    let ldr = read_pointer(memory, peb + view.peb_ldr_offset(), view)?;
    if ldr == 0 {
        return Err(SpecterError::Unsuccessful);
    }

    let (initialized, first_link) = match view {
        LoaderView::Native => {
            let data: PebLdr64 = read_struct(memory, ldr)?;
            (data.initialized != 0, data.in_load_order_module_list.flink)
        }
        LoaderView::Compat32 => {
            let data: PebLdr32 = read_struct(memory, ldr)?;
            (
                data.initialized != 0,
                data.in_load_order_module_list.flink as u64,
            )
        }
    };
    if !initialized {
        return Err(SpecterError::Unsuccessful);
    }

    let head = ldr + view.list_head_offset();
    let mut link = first_link;
    let mut steps = 0usize;

    while link != head {
        if link == 0 {
            return Err(SpecterError::Unsuccessful);
        }
        steps += 1;
        if steps > MAX_FOREIGN_MODULES {
            return Err(SpecterError::Unsuccessful);
        }

        // The links sit at the front of the entry, so stepping back from the
        // link address yields the entry itself.
        let entry_address = link - view.load_order_links_offset();
        let (module, next) = match view {
            LoaderView::Native => {
                let entry: LdrEntry64 = read_struct(memory, entry_address)?;
                (snapshot_native(memory, &entry), entry.in_load_order_links.flink)
            }
            LoaderView::Compat32 => {
                let entry: LdrEntry32 = read_struct(memory, entry_address)?;
                (
                    snapshot_compat(memory, &entry),
                    entry.in_load_order_links.flink as u64,
                )
            }
        };

        if let Some(module) = module {
            if callback(&module) == Walk::Stop {
                return Ok(WalkOutcome::Stopped);
            }
        }
        link = next;
    }

    Ok(WalkOutcome::Completed)
}

/// Adapter that reads through an open process handle.
#[cfg(windows)]
pub struct ProcessMemory {
    process: HANDLE,
}

#[cfg(windows)]
impl ProcessMemory {
    /// The handle must carry read access for the walked region.
    pub fn new(process: HANDLE) -> Self {
        Self { process }
    }
}

#[cfg(windows)]
impl MemorySource for ProcessMemory {
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        memory::read_process_memory(self.process, address, buffer)
    }
}

/// Enumerates the native-bitness modules of a foreign process.
///
/// # Arguments
///
/// * `process` - Handle with read and query-information access.
/// * `callback` - Invoked per module; returning [`Walk::Stop`] halts the walk.
///
/// # Returns
///
/// * `Ok(WalkOutcome)` - Whether the callback stopped the walk or it reached
///   the sentinel.
/// * `Err(SpecterError)` - Access-denied when the environment block is not
///   visible (a native target inspected from a WOW64 caller), unsuccessful
///   when the target's loader has not initialized, or any read failure.
#[cfg(windows)]
pub fn enumerate_process_modules<F>(process: HANDLE, callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&ForeignModule) -> Walk,
{
    let info = query::query_process_information(process, ProcessInformationClass::Basic)?;
    // SAFETY: ProcessBasicInformation fills the buffer with this layout.
    let basic: &PROCESS_BASIC_INFORMATION = unsafe { info.view()? };

    let peb = basic.PebBaseAddress as u64;
    if peb == 0 {
        return Err(SpecterError::AccessDenied);
    }

    walk_foreign_modules(&ProcessMemory::new(process), peb, LoaderView::Native, callback)
}

/// Enumerates the 32-bit modules of a WOW64 process.
///
/// Reports `NotFound` when the target has no compatibility-subsystem
/// environment block, i.e. it is a native process.
#[cfg(windows)]
pub fn enumerate_process_modules32<F>(process: HANDLE, callback: F) -> Result<WalkOutcome>
where
    F: FnMut(&ForeignModule) -> Walk,
{
    let info = query::query_process_information(process, ProcessInformationClass::Wow64)?;
    // SAFETY: ProcessWow64Information fills the buffer with a pointer-sized value.
    let wow64_peb: &usize = unsafe { info.view()? };

    let peb = *wow64_peb as u64;
    if peb == 0 {
        return Err(SpecterError::NotFound);
    }

    walk_foreign_modules(&ProcessMemory::new(process), peb, LoaderView::Compat32, callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::{ListEntry32, ListEntry64, UnicodeString32, UnicodeString64};
    use zerocopy::{Immutable, IntoBytes};

    const BASE: u64 = 0x10000;

    struct FakeMemory {
        base: u64,
        bytes: Vec<u8>,
    }

    impl FakeMemory {
        fn new(size: usize) -> Self {
            Self {
                base: BASE,
                bytes: vec![0u8; size],
            }
        }

        fn put<T: IntoBytes + Immutable>(&mut self, address: u64, value: &T) {
            let offset = (address - self.base) as usize;
            let raw = value.as_bytes();
            self.bytes[offset..offset + raw.len()].copy_from_slice(raw);
        }

        fn put_utf16(&mut self, address: u64, text: &str) {
            let offset = (address - self.base) as usize;
            for (index, unit) in text.encode_utf16().enumerate() {
                let at = offset + index * 2;
                self.bytes[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
    }

    impl MemorySource for FakeMemory {
        fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
            let start = address
                .checked_sub(self.base)
                .ok_or(SpecterError::Unsuccessful)? as usize;
            let slice = self
                .bytes
                .get(start..start + buffer.len())
                .ok_or(SpecterError::Unsuccessful)?;
            buffer.copy_from_slice(slice);
            Ok(())
        }
    }

    const PEB: u64 = BASE;
    const LDR: u64 = BASE + 0x1000;
    const E1: u64 = BASE + 0x2000;
    const E2: u64 = BASE + 0x2100;
    const E3: u64 = BASE + 0x2200;
    const NAME: u64 = BASE + 0x3000;

    fn native_target(initialized: u8) -> FakeMemory {
        let mut memory = FakeMemory::new(0x4000);
        let head = LDR + 0x10;

        memory.put(PEB + PEB64_LDR_OFFSET, &LDR);
        memory.put(
            LDR,
            &PebLdr64 {
                length: 0x58,
                initialized,
                in_load_order_module_list: ListEntry64 { flink: E1, blink: head },
                ..Default::default()
            },
        );

        memory.put(
            E1,
            &LdrEntry64 {
                in_load_order_links: ListEntry64 { flink: E2, blink: head },
                dll_base: 0x7FF8_0000_0000,
                entry_point: 0x7FF8_0000_1000,
                size_of_image: 0x2_0000,
                full_dll_name: UnicodeString64 {
                    length: ("one.dll".len() * 2) as u16,
                    maximum_length: 16,
                    buffer: NAME,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        memory.put_utf16(NAME, "one.dll");

        // Placeholder node with no mapped image; the walk must skip it.
        memory.put(
            E2,
            &LdrEntry64 {
                in_load_order_links: ListEntry64 { flink: E3, blink: E1 },
                dll_base: 0,
                ..Default::default()
            },
        );

        memory.put(
            E3,
            &LdrEntry64 {
                in_load_order_links: ListEntry64 { flink: head, blink: E2 },
                dll_base: 0x7FF9_0000_0000,
                entry_point: 0,
                size_of_image: 0x1000,
                // Name buffer points outside the readable image on purpose.
                full_dll_name: UnicodeString64 {
                    length: 8,
                    maximum_length: 8,
                    buffer: BASE + 0x9000,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        memory
    }

    #[test]
    fn walks_every_real_module_and_skips_placeholders() {
        let memory = native_target(1);
        let mut modules = Vec::new();
        let outcome = walk_foreign_modules(&memory, PEB, LoaderView::Native, |module| {
            modules.push(module.clone());
            Walk::Continue
        })
        .expect("walk should reach the sentinel");

        assert_eq!(outcome, WalkOutcome::Completed);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].dll_base, 0x7FF8_0000_0000);
        assert_eq!(modules[0].full_name, "one.dll");
        assert_eq!(modules[1].dll_base, 0x7FF9_0000_0000);
        // Unreadable names degrade to empty rather than ending the walk.
        assert_eq!(modules[1].full_name, "");
    }

    #[test]
    fn the_callback_can_stop_after_the_first_module() {
        let memory = native_target(1);
        let mut visits = 0;
        let outcome = walk_foreign_modules(&memory, PEB, LoaderView::Native, |_| {
            visits += 1;
            Walk::Stop
        })
        .expect("walk should start");

        assert_eq!(outcome, WalkOutcome::Stopped);
        assert_eq!(visits, 1);
    }

    #[test]
    fn an_uninitialized_loader_is_reported() {
        let memory = native_target(0);
        let result = walk_foreign_modules(&memory, PEB, LoaderView::Native, |_| Walk::Continue);
        assert_eq!(result.unwrap_err(), SpecterError::Unsuccessful);
    }

    #[test]
    fn a_null_loader_pointer_is_reported() {
        let mut memory = FakeMemory::new(0x100);
        memory.put(PEB + PEB64_LDR_OFFSET, &0u64);
        let result = walk_foreign_modules(&memory, PEB, LoaderView::Native, |_| Walk::Continue);
        assert_eq!(result.unwrap_err(), SpecterError::Unsuccessful);
    }

    #[test]
    fn compat_targets_walk_with_narrow_structures() {
        let mut memory = FakeMemory::new(0x4000);
        let ldr = (BASE + 0x800) as u32;
        let e1 = (BASE + 0x900) as u32;
        let e2 = (BASE + 0x980) as u32;
        let head = ldr + 0x0C;
        let name = (BASE + 0xA00) as u32;

        memory.put(PEB + PEB32_LDR_OFFSET, &ldr);
        memory.put(
            ldr as u64,
            &PebLdr32 {
                length: 0x30,
                initialized: 1,
                in_load_order_module_list: ListEntry32 { flink: e1, blink: head },
                ..Default::default()
            },
        );
        memory.put(
            e1 as u64,
            &LdrEntry32 {
                in_load_order_links: ListEntry32 { flink: e2, blink: head },
                dll_base: 0x0040_0000,
                entry_point: 0x0040_1000,
                size_of_image: 0x8000,
                full_dll_name: UnicodeString32 {
                    length: ("app.exe".len() * 2) as u16,
                    maximum_length: 16,
                    buffer: name,
                },
                ..Default::default()
            },
        );
        memory.put_utf16(name as u64, "app.exe");
        memory.put(
            e2 as u64,
            &LdrEntry32 {
                in_load_order_links: ListEntry32 { flink: head, blink: e1 },
                dll_base: 0x7700_0000,
                size_of_image: 0x1000,
                ..Default::default()
            },
        );

        let mut modules = Vec::new();
        let outcome = walk_foreign_modules(&memory, PEB, LoaderView::Compat32, |module| {
            modules.push(module.clone());
            Walk::Continue
        })
        .expect("walk should reach the sentinel");

        assert_eq!(outcome, WalkOutcome::Completed);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].dll_base, 0x0040_0000);
        assert_eq!(modules[0].full_name, "app.exe");
        assert_eq!(modules[1].dll_base, 0x7700_0000);
    }

    #[test]
    fn a_truncated_chain_read_fails_the_walk() {
        // Loader data claims an entry that sits outside the readable image.
        let mut memory = FakeMemory::new(0x1100);
        memory.put(PEB + PEB64_LDR_OFFSET, &LDR);
        memory.put(
            LDR,
            &PebLdr64 {
                length: 0x58,
                initialized: 1,
                in_load_order_module_list: ListEntry64 {
                    flink: BASE + 0x8000,
                    blink: LDR + 0x10,
                },
                ..Default::default()
            },
        );

        let result = walk_foreign_modules(&memory, PEB, LoaderView::Native, |_| Walk::Continue);
        assert_eq!(result.unwrap_err(), SpecterError::Unsuccessful);
    }

    #[cfg(windows)]
    mod live {
        use super::super::*;
        use crate::utils::handle::current_process;

        #[test]
        fn ntdll_appears_in_our_own_module_walk() {
            let mut seen_ntdll = false;
            enumerate_process_modules(current_process(), |module| {
                if module.full_name.to_ascii_lowercase().ends_with("ntdll.dll") {
                    seen_ntdll = true;
                    Walk::Stop
                } else {
                    Walk::Continue
                }
            })
            .expect("walking our own modules should succeed");
            assert!(seen_ntdll);
        }
    }
}
