//! Windows API and binary constants.

#![allow(non_upper_case_globals)]

pub type DWORD = u32;
pub type WORD = u16;
pub type LANGID = WORD;


// https://learn.microsoft.com/en-us/windows/win32/menurc/vs-versioninfo

pub const VS_VERSION_INFO_KEY: &str = "VS_VERSION_INFO";
pub const VS_STRING_FILE_INFO_KEY: &str = "StringFileInfo";
pub const VS_VAR_FILE_INFO_KEY: &str = "VarFileInfo";
pub const VS_TRANSLATION_KEY: &str = "Translation";
// en-US, UTF-16LE
pub const VS_STRING_TABLE_KEY: &str = "040904B0";

pub const VS_COMPANY_NAME: &str = "CompanyName";
pub const VS_FILE_DESCRIPTION: &str = "FileDescription";
pub const VS_FILE_VERSION: &str = "FileVersion";
pub const VS_PRODUCT_NAME: &str = "ProductName";
pub const VS_PRODUCT_VERSION: &str = "ProductVersion";

pub const VS_BLOCK_TYPE_BINARY: WORD = 0;
pub const VS_BLOCK_TYPE_TEXT: WORD = 1;


// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-lcid/a9eac961-e77d-41a6-90a5-ce1a8b0cdb9c
pub const LANGUAGE_ID_EN_US: LANGID = 1033; // 0x0409, en-US
// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-ucoderef/28fefe92-d66c-4b03-90a9-97b473223d43
pub const CODE_PAGE_ID_UNICODE: LANGID = 1200; // 0x04B0, UTF-16LE
// numeric form of the string table key, stored as one little-endian dword
pub const VS_TRANSLATION_VALUE: DWORD = 0x040904B0;


// https://docs.microsoft.com/en-us/windows/win32/api/verrsrc/ns-verrsrc-vs_fixedfileinfo

pub const VS_FIXEDFILEINFO_SIGNATURE: DWORD = 0xFEEF04BD;
pub const VS_FIXEDFILEINFO_VERSION: DWORD = 0x00010000;
pub const VS_FFI_FILEFLAGSMASK: DWORD = 0x0000003F;

pub const VOS_NT_WINDOWS32: DWORD = 0x00040004;

pub const VFT_APP: DWORD = 0x00000001;
pub const VFT2_UNKNOWN: DWORD = 0x00000000;


// https://learn.microsoft.com/en-us/windows/win32/menurc/resource-file-formats

pub const ICON_CONTAINER_TYPE_ICON: WORD = 1;
pub const ICON_HEADER_SIZE: usize = 6;
pub const ICON_FILE_ENTRY_SIZE: usize = 16;
pub const ICON_GROUP_ENTRY_SIZE: usize = 14;


// https://docs.microsoft.com/en-us/windows/win32/debug/pe-format

pub const PE_DOS_MAGIC: WORD = 0x5a4d; // MZ
pub const PE_PTR_OFFSET: DWORD = 0x03c;
pub const PE_NT_SIGNATURE: DWORD = 0x00004550; // PE00
pub const PE_32_MAGIC: WORD = 0x010b;
pub const PE_64_MAGIC: WORD = 0x020b;


// https://docs.microsoft.com/en-us/windows/win32/menurc/resource-types

pub const RT_ICON: WORD = 0x03;
pub const RT_RCDATA: WORD = 0x0A;
pub const RT_GROUP_ICON: WORD = 0x0E;
pub const RT_VERSION: WORD = 0x10;

/// Resource id of the application asset blob.
pub const ASSET_RESOURCE_ID: WORD = 1004;
/// Resource id of the application icon group.
pub const ICON_GROUP_RESOURCE_ID: WORD = 1;
/// First resource id assigned to icon images.
pub const ICON_IMAGE_BASE_ID: WORD = 1;
/// Resource id of the version record.
pub const VERSION_RESOURCE_ID: WORD = 1;


// https://docs.microsoft.com/en-us/windows/win32/debug/pe-format#section-flags

pub const IMAGE_SCN_CNT_INITIALIZED_DATA: DWORD = 0x00000040;
pub const IMAGE_SCN_MEM_READ: DWORD = 0x40000000;

pub const IMAGE_RESOURCE_SECTION_NAME: &[u8; 8] = b".rsrc\0\0\0";
