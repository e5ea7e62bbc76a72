//! Read-only mapping and inspection of executable image files.
//!
//! An image is mapped as a section view, validated from the header down, and
//! exposed with its parsed headers plus relative-offset translation. Header
//! validation happens only after the view exists, so a malformed file is a
//! data error, not a resource error; the view guard still unmaps exactly once
//! on every path.

use zerocopy::FromBytes;

use crate::data::pe::{
    DosHeader, FileHeader, OptionalHeader32, OptionalHeader64, SectionHeader, DOS_MAGIC,
    NT_SIGNATURE, PE32PLUS_MAGIC, PE32_MAGIC,
};
use crate::error::{Result, SpecterError};

#[cfg(windows)]
use {
    crate::error::nt_success,
    crate::fileio,
    crate::utils::handle::{current_process, Handle},
    core::{mem, ptr, slice},
    ntapi::ntmmapi::{NtCreateSection, NtMapViewOfSection, NtUnmapViewOfSection, ViewShare},
    winapi::shared::ntdef::{HANDLE, LARGE_INTEGER, PVOID},
    winapi::um::winnt::{
        FILE_EXECUTE, FILE_READ_ATTRIBUTES, FILE_READ_DATA, PAGE_EXECUTE_READ, SEC_COMMIT,
        SECTION_ALL_ACCESS, SYNCHRONIZE,
    },
};

/// Per-bitness optional header variant, selected by the magic field.
#[derive(Debug, Clone)]
pub enum OptionalHeader {
    Pe32(OptionalHeader32),
    Pe64(OptionalHeader64),
}

impl OptionalHeader {
    pub fn is_64bit(&self) -> bool {
        matches!(self, Self::Pe64(_))
    }

    pub fn image_base(&self) -> u64 {
        match self {
            Self::Pe32(header) => header.image_base as u64,
            Self::Pe64(header) => header.image_base,
        }
    }

    pub fn entry_point_rva(&self) -> u32 {
        match self {
            Self::Pe32(header) => header.address_of_entry_point,
            Self::Pe64(header) => header.address_of_entry_point,
        }
    }

    pub fn size_of_image(&self) -> u32 {
        match self {
            Self::Pe32(header) => header.size_of_image,
            Self::Pe64(header) => header.size_of_image,
        }
    }
}

/// Parsed header set of an executable image.
#[derive(Debug, Clone)]
pub struct PeInfo {
    /// Offset of the NT headers inside the image.
    pub nt_headers_offset: usize,
    pub file_header: FileHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<SectionHeader>,
}

/// Parses and validates image headers from raw bytes.
///
/// The NT signature is checked before anything below it is trusted, then the
/// optional-header magic selects the 32- or 64-bit view. The section table
/// immediately follows the optional header, whose size the file header
/// declares.
pub fn parse_image(bytes: &[u8]) -> Result<PeInfo> {
    let (dos, _) =
        DosHeader::read_from_prefix(bytes).map_err(|_| SpecterError::InvalidImageFormat)?;
    if dos.e_magic != DOS_MAGIC {
        return Err(SpecterError::InvalidImageFormat);
    }

    let nt_offset = dos.e_lfanew as usize;
    let nt_bytes = bytes.get(nt_offset..).ok_or(SpecterError::InvalidImageFormat)?;
    let signature = nt_bytes
        .get(..4)
        .map(|sig| u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]]))
        .ok_or(SpecterError::InvalidImageFormat)?;
    if signature != NT_SIGNATURE {
        return Err(SpecterError::InvalidImageFormat);
    }

    let (file_header, optional_bytes) = FileHeader::read_from_prefix(&nt_bytes[4..])
        .map_err(|_| SpecterError::InvalidImageFormat)?;

    let magic = optional_bytes
        .get(..2)
        .map(|m| u16::from_le_bytes([m[0], m[1]]))
        .ok_or(SpecterError::InvalidImageFormat)?;
    let optional_header = match magic {
        PE32_MAGIC => OptionalHeader::Pe32(
            OptionalHeader32::read_from_prefix(optional_bytes)
                .map_err(|_| SpecterError::InvalidImageFormat)?
                .0,
        ),
        PE32PLUS_MAGIC => OptionalHeader::Pe64(
            OptionalHeader64::read_from_prefix(optional_bytes)
                .map_err(|_| SpecterError::InvalidImageFormat)?
                .0,
        ),
        _ => return Err(SpecterError::InvalidImageFormat),
    };

    let table_offset = nt_offset
        + 4
        + core::mem::size_of::<FileHeader>()
        + file_header.size_of_optional_header as usize;
    let mut cursor = bytes.get(table_offset..).ok_or(SpecterError::InvalidImageFormat)?;

    let mut sections = Vec::with_capacity(file_header.number_of_sections as usize);
    for _ in 0..file_header.number_of_sections {
        let (section, rest) =
            SectionHeader::read_from_prefix(cursor).map_err(|_| SpecterError::InvalidImageFormat)?;
        sections.push(section);
        cursor = rest;
    }

    Ok(PeInfo {
        nt_headers_offset: nt_offset,
        file_header,
        optional_header,
        sections,
    })
}

/// Finds the section whose raw extent contains `rva`.
pub fn rva_to_section<'a>(sections: &'a [SectionHeader], rva: u32) -> Option<&'a SectionHeader> {
    sections.iter().find(|section| section.contains_rva(rva))
}

/// Translates `rva` to a file offset through its owning section.
///
/// An RVA outside every section yields `None`; that is an answer, not an
/// error.
pub fn rva_to_file_offset(sections: &[SectionHeader], rva: u32) -> Option<u64> {
    let section = rva_to_section(sections, rva)?;
    Some((rva - section.virtual_address) as u64 + section.pointer_to_raw_data as u64)
}

/// Owns one mapped view and unmaps it exactly once.
#[cfg(windows)]
struct SectionView {
    base: PVOID,
    size: usize,
}

#[cfg(windows)]
impl Drop for SectionView {
    fn drop(&mut self) {
        // SAFETY: base came from NtMapViewOfSection in this process.
        unsafe {
            NtUnmapViewOfSection(current_process(), self.base);
        }
    }
}

/// An executable file mapped read-only for static inspection.
#[cfg(windows)]
pub struct MappedImage {
    view: SectionView,
    info: PeInfo,
}

#[cfg(windows)]
impl MappedImage {
    /// Maps `path` as a read-execute section view and parses its headers.
    ///
    /// # Arguments
    ///
    /// * `path` - DOS path of the image file.
    ///
    /// # Returns
    ///
    /// * `Ok(MappedImage)` - The validated, mapped image.
    /// * `Err(SpecterError)` - Open/section/map failures, or
    ///   `InvalidImageFormat` when the mapped bytes fail validation.
    pub fn map(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(SpecterError::InvalidParameter(1));
        }

        let file = fileio::open_file(
            path,
            FILE_EXECUTE | FILE_READ_ATTRIBUTES | FILE_READ_DATA | SYNCHRONIZE,
        )?;
        let file_size = fileio::file_size(&file)?;

        let mut maximum_size: LARGE_INTEGER = unsafe { mem::zeroed() };
        // SAFETY: LARGE_INTEGER is a plain union; QuadPart covers all of it.
        unsafe { *maximum_size.QuadPart_mut() = file_size as i64 };

        let mut section_raw: HANDLE = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let status = unsafe {
            NtCreateSection(
                &mut section_raw,
                SECTION_ALL_ACCESS,
                ptr::null_mut(),
                &mut maximum_size,
                PAGE_EXECUTE_READ,
                SEC_COMMIT,
                file.as_raw(),
            )
        };
        if !nt_success(status) {
            return Err(SpecterError::from_status("NtCreateSection", status));
        }
        // SAFETY: the section handle was just opened by us.
        let section = unsafe { Handle::from_raw(section_raw) };

        let mut base: PVOID = ptr::null_mut();
        let mut view_size = file_size as usize;
        // SAFETY: all in-out pointers are owned by this frame.
        let status = unsafe {
            NtMapViewOfSection(
                section.as_raw(),
                current_process(),
                &mut base,
                0,
                0,
                ptr::null_mut(),
                &mut view_size,
                ViewShare,
                0,
                PAGE_EXECUTE_READ,
            )
        };
        if !nt_success(status) {
            return Err(SpecterError::from_status("NtMapViewOfSection", status));
        }

        // From here on the guard owns the view; validation failures below
        // drop it and the view is unmapped before the error reaches the
        // caller.
        let view = SectionView {
            base,
            size: view_size,
        };

        // SAFETY: the view covers `size` committed read-only bytes.
        let bytes = unsafe { slice::from_raw_parts(view.base as *const u8, view.size) };
        let info = parse_image(bytes)?;

        Ok(Self { view, info })
    }

    pub fn view_base(&self) -> u64 {
        self.view.base as u64
    }

    pub fn view_size(&self) -> usize {
        self.view.size
    }

    pub fn info(&self) -> &PeInfo {
        &self.info
    }

    pub fn is_64bit(&self) -> bool {
        self.info.optional_header.is_64bit()
    }

    /// The mapped bytes of the whole view.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the view stays mapped for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.view.base as *const u8, self.view.size) }
    }

    /// Translates an RVA into an address inside the mapped view.
    pub fn rva_to_va(&self, rva: u32) -> Option<u64> {
        rva_to_file_offset(&self.info.sections, rva).map(|offset| self.view_base() + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::pe::DataDirectory;
    use zerocopy::{Immutable, IntoBytes};

    fn put<T: IntoBytes + Immutable>(buffer: &mut [u8], offset: usize, value: &T) {
        let raw = value.as_bytes();
        buffer[offset..offset + raw.len()].copy_from_slice(raw);
    }

    const NT_OFFSET: usize = 0x80;

    fn minimal_image64() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x800];

        let dos = DosHeader {
            e_magic: DOS_MAGIC,
            e_lfanew: NT_OFFSET as u32,
            ..Default::default()
        };
        put(&mut bytes, 0, &dos);
        put(&mut bytes, NT_OFFSET, &NT_SIGNATURE);

        let file_header = FileHeader {
            machine: 0x8664,
            number_of_sections: 2,
            size_of_optional_header: core::mem::size_of::<OptionalHeader64>() as u16,
            ..Default::default()
        };
        put(&mut bytes, NT_OFFSET + 4, &file_header);

        let optional = OptionalHeader64 {
            magic: PE32PLUS_MAGIC,
            address_of_entry_point: 0x1010,
            image_base: 0x1_4000_0000,
            size_of_image: 0x3000,
            number_of_rva_and_sizes: 16,
            data_directory: [DataDirectory::default(); 16],
            ..Default::default()
        };
        let optional_offset = NT_OFFSET + 4 + core::mem::size_of::<FileHeader>();
        put(&mut bytes, optional_offset, &optional);

        let table_offset = optional_offset + core::mem::size_of::<OptionalHeader64>();
        let mut text = SectionHeader {
            virtual_address: 0x1000,
            virtual_size: 0x180,
            size_of_raw_data: 0x200,
            pointer_to_raw_data: 0x400,
            ..Default::default()
        };
        text.name[..5].copy_from_slice(b".text");
        put(&mut bytes, table_offset, &text);

        let mut data = SectionHeader {
            virtual_address: 0x2000,
            virtual_size: 0x80,
            size_of_raw_data: 0x100,
            pointer_to_raw_data: 0x600,
            ..Default::default()
        };
        data.name[..5].copy_from_slice(b".data");
        put(&mut bytes, table_offset + core::mem::size_of::<SectionHeader>(), &data);

        bytes
    }

    #[test]
    fn a_minimal_image_parses_into_both_sections() {
        let info = parse_image(&minimal_image64()).expect("image should parse");
        assert!(info.optional_header.is_64bit());
        assert_eq!(info.nt_headers_offset, NT_OFFSET);
        assert_eq!(info.sections.len(), 2);
        assert_eq!(info.sections[0].name_str(), ".text");
        assert_eq!(info.optional_header.entry_point_rva(), 0x1010);
    }

    #[test]
    fn the_first_section_start_translates_to_its_raw_pointer() {
        let info = parse_image(&minimal_image64()).expect("image should parse");
        assert_eq!(
            rva_to_file_offset(&info.sections, 0x1000),
            Some(info.sections[0].pointer_to_raw_data as u64)
        );
    }

    #[test]
    fn an_rva_past_the_last_section_is_not_translated() {
        let info = parse_image(&minimal_image64()).expect("image should parse");
        // One byte past the last section's raw extent.
        assert_eq!(rva_to_file_offset(&info.sections, 0x2100), None);
        // Last byte inside it still resolves.
        assert_eq!(rva_to_file_offset(&info.sections, 0x20FF), Some(0x6FF));
    }

    #[test]
    fn a_bad_nt_signature_is_a_format_error() {
        let mut bytes = minimal_image64();
        bytes[NT_OFFSET] = b'X';
        assert_eq!(
            parse_image(&bytes).unwrap_err(),
            SpecterError::InvalidImageFormat
        );
    }

    #[test]
    fn a_bad_optional_magic_is_a_format_error() {
        let mut bytes = minimal_image64();
        let magic_offset = NT_OFFSET + 4 + core::mem::size_of::<FileHeader>();
        bytes[magic_offset] = 0;
        bytes[magic_offset + 1] = 0;
        assert_eq!(
            parse_image(&bytes).unwrap_err(),
            SpecterError::InvalidImageFormat
        );
    }

    #[test]
    fn a_missing_dos_magic_is_a_format_error() {
        let mut bytes = minimal_image64();
        bytes[0] = 0;
        assert_eq!(
            parse_image(&bytes).unwrap_err(),
            SpecterError::InvalidImageFormat
        );
    }

    #[test]
    fn a_truncated_section_table_is_a_format_error() {
        let mut bytes = minimal_image64();
        let table_offset = NT_OFFSET + 4 + core::mem::size_of::<FileHeader>()
            + core::mem::size_of::<OptionalHeader64>();
        bytes.truncate(table_offset + 8);
        assert_eq!(
            parse_image(&bytes).unwrap_err(),
            SpecterError::InvalidImageFormat
        );
    }

    #[test]
    fn pe32_images_select_the_narrow_optional_header() {
        let mut bytes = vec![0u8; 0x400];
        let dos = DosHeader {
            e_magic: DOS_MAGIC,
            e_lfanew: 0x40,
            ..Default::default()
        };
        put(&mut bytes, 0, &dos);
        put(&mut bytes, 0x40, &NT_SIGNATURE);
        let file_header = FileHeader {
            machine: 0x014C,
            number_of_sections: 0,
            size_of_optional_header: core::mem::size_of::<OptionalHeader32>() as u16,
            ..Default::default()
        };
        put(&mut bytes, 0x44, &file_header);
        let optional = OptionalHeader32 {
            magic: PE32_MAGIC,
            image_base: 0x40_0000,
            ..Default::default()
        };
        put(&mut bytes, 0x44 + core::mem::size_of::<FileHeader>(), &optional);

        let info = parse_image(&bytes).expect("image should parse");
        assert!(!info.optional_header.is_64bit());
        assert_eq!(info.optional_header.image_base(), 0x40_0000);
        assert!(info.sections.is_empty());
    }

    #[cfg(windows)]
    mod live {
        use super::super::*;

        #[test]
        fn mapping_ntdll_round_trips_its_first_section() {
            let image = MappedImage::map("C:\\Windows\\System32\\ntdll.dll")
                .expect("mapping ntdll should succeed");
            #[cfg(target_arch = "x86_64")]
            assert!(image.is_64bit());

            let first = image.info().sections[0];
            let translated = image
                .rva_to_va(first.virtual_address)
                .expect("first section start should translate");
            assert_eq!(
                translated,
                image.view_base() + first.pointer_to_raw_data as u64
            );
        }
    }
}
