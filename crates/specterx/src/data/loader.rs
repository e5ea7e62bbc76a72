//! Value-struct snapshots of the per-process loader bookkeeping.
//!
//! A foreign process's module list lives entirely inside that process, so
//! these layouts are copied out byte-for-byte and never treated as live
//! pointers. Two widths exist: the native 64-bit structures and the narrower
//! copies the 32-bit compatibility subsystem maintains for WOW64 processes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Offset of the loader-data pointer inside the 64-bit environment block.
pub const PEB64_LDR_OFFSET: u64 = 0x18;

/// Offset of the loader-data pointer inside the 32-bit environment block.
pub const PEB32_LDR_OFFSET: u64 = 0x0C;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ListEntry64 {
    pub flink: u64,
    pub blink: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ListEntry32 {
    pub flink: u32,
    pub blink: u32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnicodeString64 {
    pub length: u16,
    pub maximum_length: u16,
    pub _pad: u32,
    pub buffer: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnicodeString32 {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: u32,
}

/// Head of the 64-bit loader data, down to the in-load-order list.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PebLdr64 {
    pub length: u32,
    pub initialized: u8,
    pub _pad: [u8; 3],
    pub ss_handle: u64,
    pub in_load_order_module_list: ListEntry64,
}

/// Head of the 32-bit loader data, down to the in-load-order list.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PebLdr32 {
    pub length: u32,
    pub initialized: u8,
    pub _pad: [u8; 3],
    pub ss_handle: u32,
    pub in_load_order_module_list: ListEntry32,
}

/// Leading fields of a 64-bit loader table entry.
///
/// Only the prefix up to the base name is ever read; the entry continues in
/// the target process but nothing past this point is needed.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LdrEntry64 {
    pub in_load_order_links: ListEntry64,
    pub in_memory_order_links: ListEntry64,
    pub in_initialization_order_links: ListEntry64,
    pub dll_base: u64,
    pub entry_point: u64,
    pub size_of_image: u32,
    pub _pad: u32,
    pub full_dll_name: UnicodeString64,
    pub base_dll_name: UnicodeString64,
}

/// Leading fields of a 32-bit loader table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LdrEntry32 {
    pub in_load_order_links: ListEntry32,
    pub in_memory_order_links: ListEntry32,
    pub in_initialization_order_links: ListEntry32,
    pub dll_base: u32,
    pub entry_point: u32,
    pub size_of_image: u32,
    pub full_dll_name: UnicodeString32,
    pub base_dll_name: UnicodeString32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layouts_match_the_platform_contract() {
        assert_eq!(size_of::<ListEntry64>(), 0x10);
        assert_eq!(size_of::<PebLdr64>(), 0x20);
        assert_eq!(offset_of!(PebLdr64, in_load_order_module_list), 0x10);
        assert_eq!(offset_of!(LdrEntry64, dll_base), 0x30);
        assert_eq!(offset_of!(LdrEntry64, entry_point), 0x38);
        assert_eq!(offset_of!(LdrEntry64, size_of_image), 0x40);
        assert_eq!(offset_of!(LdrEntry64, full_dll_name), 0x48);
        assert_eq!(size_of::<LdrEntry64>(), 0x68);
    }

    #[test]
    fn compat_layouts_use_narrow_fields_throughout() {
        assert_eq!(size_of::<ListEntry32>(), 0x08);
        assert_eq!(size_of::<PebLdr32>(), 0x14);
        assert_eq!(offset_of!(PebLdr32, in_load_order_module_list), 0x0C);
        assert_eq!(offset_of!(LdrEntry32, dll_base), 0x18);
        assert_eq!(offset_of!(LdrEntry32, entry_point), 0x1C);
        assert_eq!(offset_of!(LdrEntry32, size_of_image), 0x20);
        assert_eq!(offset_of!(LdrEntry32, full_dll_name), 0x24);
        assert_eq!(size_of::<LdrEntry32>(), 0x34);
    }
}
