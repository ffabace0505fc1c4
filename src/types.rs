//! Portable executable header types.
//!
//! Plain little-endian mappings of the headers described in <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>
//! that are read and rewritten when the resource section of an image is replaced.

use core::{mem, slice};

use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Major and minor version pair.
#[repr(C, packed(2))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct VersionU16 {
    pub major: u16,
    pub minor: u16,
}

/// COFF file header following the PE signature.
#[repr(C, packed(2))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct CoffHeader {
    pub machine:                 u16,
    pub number_of_sections:      u16,
    pub time_date_stamp:         u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols:       u32,
    pub size_of_optional_header: u16,
    pub characteristics:         u16,
}

/// Windows specific fields of the optional header.
/// `UXX` is `u32` for PE32 images and `u64` for PE32+ images.
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes)]
pub struct WindowsHeader<UXX> {
    pub image_base:               UXX,
    pub section_alignment:        u32,
    pub file_alignment:           u32,
    pub operating_system_version: VersionU16,
    pub image_version:            VersionU16,
    pub subsystem_version:        VersionU16,
    pub win32_version_value:      u32,
    pub size_of_image:            u32,
    pub size_of_headers:          u32,
    pub check_sum:                u32,
    pub subsystem:                u16,
    pub dll_characteristics:      u16,
    pub size_of_stack_reserve:    UXX,
    pub size_of_stack_commit:     UXX,
    pub size_of_heap_reserve:     UXX,
    pub size_of_heap_commit:      UXX,
    pub loader_flags:             u32,
    pub number_of_rva_and_sizes:  u32,
}
impl<UXX: IntoBytes> WindowsHeader<UXX> {
    pub fn as_bytes(&self) -> &[u8] {
        // zerocopy can't derive IntoBytes for generic types, both instantiations have no padding
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, mem::size_of_val(self)) }
    }
}

/// Windows header of either a PE32 or a PE32+ image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GenericWindowsHeader {
    WindowsHeader32(WindowsHeader<u32>),
    WindowsHeader64(WindowsHeader<u64>),
}

macro_rules! windows_header_field {
    ($self:ident, $field:ident) => {
        match $self {
            GenericWindowsHeader::WindowsHeader32(header) => header.$field,
            GenericWindowsHeader::WindowsHeader64(header) => header.$field,
        }
    };
}

impl GenericWindowsHeader {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.as_bytes(),
            GenericWindowsHeader::WindowsHeader64(header) => header.as_bytes(),
        }
    }

    pub const fn section_alignment(&self) -> u32 { windows_header_field!(self, section_alignment) }

    pub const fn file_alignment(&self) -> u32 { windows_header_field!(self, file_alignment) }

    pub const fn size_of_image(&self) -> u32 { windows_header_field!(self, size_of_image) }

    pub const fn check_sum(&self) -> u32 { windows_header_field!(self, check_sum) }

    pub const fn number_of_rva_and_sizes(&self) -> u32 {
        windows_header_field!(self, number_of_rva_and_sizes)
    }

    /// Set the image size and invalidate the checksum after the section layout changed.
    pub fn set_size_of_image(&mut self, size_of_image: u32) {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => {
                header.size_of_image = size_of_image;
                header.check_sum = 0;
            }
            GenericWindowsHeader::WindowsHeader64(header) => {
                header.size_of_image = size_of_image;
                header.check_sum = 0;
            }
        }
    }
}

/// Address and size of a table referenced by the optional header.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size:            u32,
}

/// Entry of the section table.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct SectionHeader {
    pub name:                   u64,
    pub virtual_size:           u32,
    pub virtual_address:        u32,
    pub size_of_raw_data:       u32,
    pub pointer_to_raw_data:    u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations:  u16,
    pub number_of_linenumbers:  u16,
    pub characteristics:        u32,
}
impl SectionHeader {
    /// Returns the section name up to the first null byte, if it is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        let name = &self.as_bytes()[..8];
        let end = name.iter().position(|&c| c == b'\0').unwrap_or(name.len());
        core::str::from_utf8(&name[..end]).ok()
    }

    /// Returns whether the relative virtual address lies inside the section.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && (rva as u64) < self.virtual_end()
    }

    /// Returns the end of the section data in the file.
    pub fn raw_end(&self) -> u64 { self.pointer_to_raw_data as u64 + self.size_of_raw_data as u64 }

    /// Returns the end of the section in virtual memory.
    pub fn virtual_end(&self) -> u64 {
        self.virtual_address as u64 + self.virtual_size.max(self.size_of_raw_data) as u64
    }
}

/// Header of a resource directory table, followed by its entries.
#[repr(C, packed(2))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct ResourceDirectoryTable {
    pub characteristics:        u32,
    pub time_date_stamp:        u32,
    pub version:                VersionU16,
    pub number_of_name_entries: u16,
    pub number_of_id_entries:   u16,
}

/// Entry of a resource directory table.
/// The high bit of the name marks a string name, the high bit of the offset marks a subdirectory.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct ResourceDirectoryEntry {
    pub name_offset_or_integer_id:         u32,
    pub data_entry_or_subdirectory_offset: u32,
}

#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable)]
pub struct ResourceDataEntry {
    pub data_rva: u32,
    pub size:     u32,
    pub codepage: u32,
    pub reserved: u32,
}
