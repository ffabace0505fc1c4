//! Construction and parsing of version information records.
//!
//! A version record is a tree of blocks. Every block starts with a header of three 16 bit values
//! (total length, value length and value type) followed by a null-terminated UTF-16 key, padding to a 4 byte boundary,
//! and then either a value, child blocks, or both. Siblings are separated by padding to a 4 byte boundary,
//! which is counted towards the enclosing block and not towards the block before the padding.
//!
//! ```text
//! VS_VERSION_INFO          fixed file info
//! ├── StringFileInfo
//! │   └── 040904B0
//! │       ├── CompanyName      "..."
//! │       └── ...
//! └── VarFileInfo
//!     └── Translation          0x040904B0
//! ```
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/menurc/vs-versioninfo> for more information.

use alloc::{format, string::String, vec, vec::Vec};

use log::{debug, trace};

use crate::{constants::*, errors::*, util::*};

const BLOCK_HEADER_SIZE: usize = 6;
const MAX_DEPTH: usize = 8;

/// Version information of an executable.
///
/// Empty text fields are left out of the version record.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct VersionInfo {
    pub company_name:          String,
    pub file_description:      String,
    pub file_version:          String,
    pub product_name:          String,
    pub product_version:       String,
    pub file_version_parts:    [u16; 4],
    pub product_version_parts: [u16; 4],
}
impl VersionInfo {
    /// Set the file version string and derive the numeric file version from it.
    pub fn set_file_version<S: Into<String>>(&mut self, version: S) {
        self.file_version = version.into();
        self.file_version_parts = parse_version_parts(&self.file_version);
    }

    /// Set the product version string and derive the numeric product version from it.
    pub fn set_product_version<S: Into<String>>(&mut self, version: S) {
        self.product_version = version.into();
        self.product_version_parts = parse_version_parts(&self.product_version);
    }

    /// Returns the text fields with their keys in record order.
    pub fn string_fields(&self) -> [(&'static str, &str); 5] {
        [
            (VS_COMPANY_NAME, &self.company_name),
            (VS_FILE_DESCRIPTION, &self.file_description),
            (VS_FILE_VERSION, &self.file_version),
            (VS_PRODUCT_NAME, &self.product_name),
            (VS_PRODUCT_VERSION, &self.product_version),
        ]
    }

    /// Returns the fixed file info of the record.
    pub fn fixed_file_info(&self) -> FixedFileInfo {
        FixedFileInfo::new(self.file_version_parts, self.product_version_parts)
    }

    /// Build the version record.
    ///
    /// # Returns
    /// Returns an error if a block of the record exceeds the 16 bit length field.
    pub fn build(&self) -> Result<VersionRecord, VersionInfoError> {
        let strings = self
            .string_fields()
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| VersionBlock::text(key, value))
            .collect();
        let string_table = VersionBlock::container(VS_STRING_TABLE_KEY, BlockType::Text, strings);
        let string_file_info =
            VersionBlock::container(VS_STRING_FILE_INFO_KEY, BlockType::Text, vec![string_table]);

        let mut translation = Vec::with_capacity(4);
        write_u32(&mut translation, VS_TRANSLATION_VALUE);
        // the value length of the translation counts 16 bit words
        let var = VersionBlock::new(VS_TRANSLATION_KEY, BlockType::Binary, 2, translation, vec![]);
        let var_file_info =
            VersionBlock::container(VS_VAR_FILE_INFO_KEY, BlockType::Binary, vec![var]);

        let mut fixed_file_info = Vec::with_capacity(FixedFileInfo::SIZE);
        self.fixed_file_info().write(&mut fixed_file_info);
        let root = VersionBlock::new(
            VS_VERSION_INFO_KEY,
            BlockType::Binary,
            FixedFileInfo::SIZE as u16,
            fixed_file_info,
            vec![string_file_info, var_file_info],
        );

        let mut data = Vec::with_capacity(root.length());
        root.write(&mut data)?;
        debug!("built version record of {} bytes", data.len());
        Ok(VersionRecord { root, data })
    }
}

/// Parse a dotted version string into its numeric components.
///
/// Missing components are zero and components larger than 65535 are saturated.
/// A component with a non-numeric suffix keeps its leading digits and ends the version,
/// so `"1.2.3-beta.5"` results in `[1, 2, 3, 0]`.
pub fn parse_version_parts(version: &str) -> [u16; 4] {
    let version = version.trim().trim_start_matches(|c: char| c == 'v' || c == 'V');
    let mut parts = [0u16; 4];
    for (part, component) in parts.iter_mut().zip(version.split('.')) {
        let end = component.find(|c: char| !c.is_ascii_digit());
        let digits = end.map_or(component, |end| &component[..end]);
        *part = digits.parse::<u64>().map_or(0, |value| value.min(u16::MAX as u64) as u16);
        if end.is_some() {
            break;
        }
    }
    parts
}

/// Fixed part of a version record holding the numeric versions.
///
/// See <https://learn.microsoft.com/en-us/windows/win32/api/verrsrc/ns-verrsrc-vs_fixedfileinfo>.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FixedFileInfo {
    pub signature:          u32,
    pub struct_version:     u32,
    pub file_version_ms:    u32,
    pub file_version_ls:    u32,
    pub product_version_ms: u32,
    pub product_version_ls: u32,
    pub file_flags_mask:    u32,
    pub file_flags:         u32,
    pub file_os:            u32,
    pub file_type:          u32,
    pub file_subtype:       u32,
    pub file_date_ms:       u32,
    pub file_date_ls:       u32,
}
impl Default for FixedFileInfo {
    fn default() -> Self { Self::new([0; 4], [0; 4]) }
}
impl FixedFileInfo {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 52;

    /// Create the fixed file info of an application with the given file and product version.
    pub fn new(file_version: [u16; 4], product_version: [u16; 4]) -> Self {
        let (file_version_ms, file_version_ls) = pack_version(file_version);
        let (product_version_ms, product_version_ls) = pack_version(product_version);
        Self {
            signature: VS_FIXEDFILEINFO_SIGNATURE,
            struct_version: VS_FIXEDFILEINFO_VERSION,
            file_version_ms,
            file_version_ls,
            product_version_ms,
            product_version_ls,
            file_flags_mask: VS_FFI_FILEFLAGSMASK,
            file_flags: 0,
            file_os: VOS_NT_WINDOWS32,
            file_type: VFT_APP,
            file_subtype: VFT2_UNKNOWN,
            file_date_ms: 0,
            file_date_ls: 0,
        }
    }

    /// Returns the numeric file version.
    pub fn file_version(&self) -> [u16; 4] {
        unpack_version(self.file_version_ms, self.file_version_ls)
    }

    /// Returns the numeric product version.
    pub fn product_version(&self) -> [u16; 4] {
        unpack_version(self.product_version_ms, self.product_version_ls)
    }

    fn fields(&self) -> [u32; 13] {
        [
            self.signature,
            self.struct_version,
            self.file_version_ms,
            self.file_version_ls,
            self.product_version_ms,
            self.product_version_ls,
            self.file_flags_mask,
            self.file_flags,
            self.file_os,
            self.file_type,
            self.file_subtype,
            self.file_date_ms,
            self.file_date_ls,
        ]
    }

    fn write(&self, data: &mut Vec<u8>) {
        self.fields().into_iter().for_each(|field| write_u32(data, field));
    }

    fn read(data: &[u8], offset: usize) -> Result<Self, ReadError> {
        let field = |index: usize| read_u32(data, offset + index * 4);
        Ok(Self {
            signature:          field(0)?,
            struct_version:     field(1)?,
            file_version_ms:    field(2)?,
            file_version_ls:    field(3)?,
            product_version_ms: field(4)?,
            product_version_ls: field(5)?,
            file_flags_mask:    field(6)?,
            file_flags:         field(7)?,
            file_os:            field(8)?,
            file_type:          field(9)?,
            file_subtype:       field(10)?,
            file_date_ms:       field(11)?,
            file_date_ls:       field(12)?,
        })
    }
}

fn pack_version(parts: [u16; 4]) -> (u32, u32) {
    (
        ((parts[0] as u32) << 16) | parts[1] as u32,
        ((parts[2] as u32) << 16) | parts[3] as u32,
    )
}

fn unpack_version(ms: u32, ls: u32) -> [u16; 4] {
    [(ms >> 16) as u16, ms as u16, (ls >> 16) as u16, ls as u16]
}

/// Type of the value of a version block.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum BlockType {
    Binary = VS_BLOCK_TYPE_BINARY,
    Text = VS_BLOCK_TYPE_TEXT,
}

/// Node of a version record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionBlock {
    key:          String,
    block_type:   BlockType,
    value_length: u16,
    value:        Vec<u8>,
    children:     Vec<VersionBlock>,
}
impl VersionBlock {
    /// Create a block from its parts.
    /// The value length is stored as given, its unit depends on the block.
    pub fn new<S: Into<String>>(
        key: S, block_type: BlockType, value_length: u16, value: Vec<u8>,
        children: Vec<VersionBlock>,
    ) -> Self {
        Self {
            key: key.into(),
            block_type,
            value_length,
            value,
            children,
        }
    }

    /// Create a text block, the value length counts characters without the terminator.
    pub fn text<S: Into<String>>(key: S, value: &str) -> Self {
        let characters = value.encode_utf16().count();
        Self::new(
            key,
            BlockType::Text,
            characters.min(u16::MAX as usize) as u16,
            string_to_u16(value),
            vec![],
        )
    }

    /// Create a block only holding child blocks.
    pub fn container<S: Into<String>>(
        key: S, block_type: BlockType, children: Vec<VersionBlock>,
    ) -> Self {
        Self::new(key, block_type, 0, vec![], children)
    }

    pub fn key(&self) -> &str { &self.key }

    pub fn block_type(&self) -> BlockType { self.block_type }

    pub fn value_length(&self) -> u16 { self.value_length }

    /// Returns the raw value bytes.
    pub fn value(&self) -> &[u8] { &self.value }

    pub fn children(&self) -> &[VersionBlock] { &self.children }

    /// Returns the first child block with the key.
    pub fn child(&self, key: &str) -> Option<&VersionBlock> {
        self.children.iter().find(|child| child.key == key)
    }

    /// Returns the value decoded as null-terminated UTF-16 text.
    pub fn text_value(&self) -> Option<String> {
        if self.block_type != BlockType::Text || self.value.is_empty() {
            return None;
        }
        let units = self
            .value
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .take_while(|unit| *unit != 0)
            .collect::<Vec<_>>();
        Some(String::from_utf16_lossy(&units))
    }

    /// Returns the length of the serialized block.
    /// The length covers the header, the padded key, the value and all children,
    /// but not the padding following the value or the last child.
    pub fn length(&self) -> usize {
        let header = aligned_to(BLOCK_HEADER_SIZE + (self.key.encode_utf16().count() + 1) * 2, 4);
        self.children.iter().fold(header + self.value.len(), |length, child| {
            aligned_to(length, 4) + child.length()
        })
    }

    /// Serialize the block. The block has to start at a 4 byte boundary of the data.
    fn write(&self, data: &mut Vec<u8>) -> Result<(), VersionInfoError> {
        let length = self.length();
        if length > u16::MAX as usize {
            return Err(VersionInfoError::SizeOverflow {
                key:  self.key.clone(),
                size: length,
            });
        }
        let start = data.len();
        write_u16(data, length as u16);
        write_u16(data, self.value_length);
        write_u16(data, self.block_type as u16);
        data.extend(string_to_u16(&self.key));
        pad_to_dword(data);
        data.extend_from_slice(&self.value);
        for child in &self.children {
            pad_to_dword(data);
            child.write(data)?;
        }
        trace!("{}: {} bytes", self.key, length);
        debug_assert_eq!(data.len() - start, length, "block length matches written bytes");
        Ok(())
    }

    /// Parse the block starting at the offset.
    ///
    /// Leaf values extend to the end of their block, except the value of the root block
    /// which holds the fixed file info followed by children.
    fn parse(data: &[u8], offset: usize, depth: usize) -> Result<(Self, usize), ReadError> {
        if depth >= MAX_DEPTH {
            return Err(ReadError(format!("version block at {:#x} nested too deeply", offset)));
        }
        let length = read_u16(data, offset)? as usize;
        let value_length = read_u16(data, offset + 2)?;
        let block_type = match read_u16(data, offset + 4)? {
            VS_BLOCK_TYPE_BINARY => BlockType::Binary,
            VS_BLOCK_TYPE_TEXT => BlockType::Text,
            other => {
                return Err(ReadError(format!("version block at {:#x} has type {}", offset, other)));
            }
        };
        let end = offset + length;
        if length < BLOCK_HEADER_SIZE || end > data.len() {
            return Err(ReadError(format!(
                "version block at {:#x} has invalid length {:#x}",
                offset, length
            )));
        }
        let block = &data[..end];
        let (key, key_size) = read_u16_string(block, offset + BLOCK_HEADER_SIZE)?;
        let value_start = aligned_to(offset + BLOCK_HEADER_SIZE + key_size, 4).min(end);
        let value_end = match (depth, value_length) {
            (_, 0) => value_start,
            (0, value_length) => (value_start + value_length as usize).min(end),
            _ => end,
        };
        trace!("{}{} at {:#x}: {} bytes", "--".repeat(depth), key, offset, length);

        let mut children = Vec::new();
        let mut position = aligned_to(value_end, 4);
        while position + BLOCK_HEADER_SIZE <= end {
            let (child, child_length) = VersionBlock::parse(block, position, depth + 1)?;
            children.push(child);
            position = aligned_to(position + child_length, 4);
        }

        Ok((
            Self {
                key,
                block_type,
                value_length,
                value: data[value_start..value_end].to_vec(),
                children,
            },
            length,
        ))
    }
}

/// Serialized version record and its block tree.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionRecord {
    root: VersionBlock,
    data: Vec<u8>,
}
impl VersionRecord {
    /// Parse a serialized version record.
    pub fn parse(data: &[u8]) -> Result<Self, ReadError> {
        let (root, length) = VersionBlock::parse(data, 0, 0)?;
        if root.key != VS_VERSION_INFO_KEY {
            return Err(ReadError(format!("unexpected version record key {}", root.key)));
        }
        Ok(Self {
            root,
            data: data[..length].to_vec(),
        })
    }

    /// Returns the root block.
    pub fn root(&self) -> &VersionBlock { &self.root }

    /// Returns the serialized record.
    pub fn data(&self) -> &[u8] { &self.data }

    /// Returns the serialized record, consuming the record.
    pub fn into_data(self) -> Vec<u8> { self.data }

    /// Returns the fixed file info held by the root block.
    pub fn fixed_file_info(&self) -> Option<FixedFileInfo> {
        if self.root.value.len() < FixedFileInfo::SIZE {
            return None;
        }
        FixedFileInfo::read(&self.root.value, 0).ok()
    }

    /// Returns the string table of the record.
    pub fn string_table(&self) -> Option<&VersionBlock> {
        self.root.child(VS_STRING_FILE_INFO_KEY)?.children.first()
    }

    /// Returns the value of the string with the key.
    pub fn string(&self, key: &str) -> Option<String> {
        self.string_table()?.child(key)?.text_value()
    }

    /// Returns the translation dword, language and codepage in the same order as the string table key.
    pub fn translation(&self) -> Option<u32> {
        let var = self.root.child(VS_VAR_FILE_INFO_KEY)?.child(VS_TRANSLATION_KEY)?;
        read_u32(&var.value, 0).ok()
    }

    /// Reconstruct the version information held by the record.
    pub fn version_info(&self) -> VersionInfo {
        let fixed_file_info = self.fixed_file_info().unwrap_or_default();
        let string = |key| self.string(key).unwrap_or_default();
        VersionInfo {
            company_name:          string(VS_COMPANY_NAME),
            file_description:      string(VS_FILE_DESCRIPTION),
            file_version:          string(VS_FILE_VERSION),
            product_name:          string(VS_PRODUCT_NAME),
            product_version:       string(VS_PRODUCT_VERSION),
            file_version_parts:    fixed_file_info.file_version(),
            product_version_parts: fixed_file_info.product_version(),
        }
    }
}

