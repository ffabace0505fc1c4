//! Data types for parsing and building the resource section.
//! The resource section contains the resource directory and the resource data.
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#the-rsrc-section> for more information.

use alloc::{collections::VecDeque, format, string::String, vec::Vec};
use core::{borrow::Borrow, cmp::Ordering};

use ahash::RandomState;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use log::{trace, warn};
use zerocopy::IntoBytes;

use crate::{errors::*, types::*, util::*};

const TABLE_SIZE: u32 = 16;
const ENTRY_SIZE: u32 = 8;
const DESCRIPTION_SIZE: u32 = 16;
const DATA_ALIGNMENT: u32 = 8;
const SUBDIRECTORY_FLAG: u32 = 0x80000000;
// type, name and language levels plus slack for unusual images
const MAX_DEPTH: usize = 8;


/// Portable executable resource directory.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceDirectory {
    pub(crate) virtual_address: u32,
    pub(crate) root:            ResourceTable,
}
impl ResourceDirectory {
    /// Parse the resource directory from the given image at the given base address.
    /// The virtual address is used to resolve the resource data offsets and has to correspond to the virtual address in the section table header of the source image.
    ///
    /// # Returns
    /// Returns an error if the resource directory at the given address is invalid.
    pub fn parse(
        image: &[u8], base_address: u32, virtual_address: u32,
    ) -> Result<Self, ImageReadError> {
        let mut visited = Vec::new();
        let root = ResourceTable::parse(image, base_address, virtual_address, 0, 0, &mut visited)?;
        Ok(Self {
            virtual_address,
            root,
        })
    }

    /// Returns the virtual address of the resource directory in the source image.
    pub fn virtual_address(&self) -> u32 { self.virtual_address }

    /// Returns the root resource table.
    /// The root resource table contains one table per resource type.
    pub fn root(&self) -> &ResourceTable { &self.root }

    /// Returns the mutable root resource table.
    pub fn root_mut(&mut self) -> &mut ResourceTable { &mut self.root }

    /// Returns the size of the resulting resource directory in bytes.
    pub fn size(&self) -> u64 { SectionLayout::of(&self.root).total() }

    /// Returns the resource data for the resource type, id and language.
    pub fn get(&self, resource_type: u16, id: u16, language: u16) -> Option<&ResourceData> {
        self.root
            .get(ResourceEntryName::ID(resource_type as u32))?
            .as_table()?
            .get(ResourceEntryName::ID(id as u32))?
            .as_table()?
            .get(ResourceEntryName::ID(language as u32))?
            .as_data()
    }

    /// Set the resource data for the resource type, id and language.
    /// Missing type and name tables are created.
    ///
    /// # Returns
    /// The replaced resource data.
    pub fn set(
        &mut self, resource_type: u16, id: u16, language: u16, data: Vec<u8>,
    ) -> Option<ResourceData> {
        trace!(
            "setting resource {}/{}/{} ({} bytes)",
            resource_type,
            id,
            language,
            data.len()
        );
        self.root
            .table_entry(ResourceEntryName::ID(resource_type as u32))
            .table_entry(ResourceEntryName::ID(id as u32))
            .insert(
                ResourceEntryName::ID(language as u32),
                ResourceEntry::Data(ResourceData::new(data)),
            )
            .and_then(ResourceEntry::into_data)
    }

    /// Returns the numeric ids of all resources of the resource type.
    pub fn ids(&self, resource_type: u16) -> Vec<u32> {
        self.root
            .get(ResourceEntryName::ID(resource_type as u32))
            .and_then(ResourceEntry::as_table)
            .map(|table| {
                table
                    .entries
                    .keys()
                    .filter_map(|name| match name {
                        ResourceEntryName::ID(id) => Some(*id),
                        ResourceEntryName::Name(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build the resource directory into raw bytes to be included in an image.
    /// The virtual address is used to compute the resource data offsets and has to correspond to the virtual address in the section table header of the target image.
    pub fn build(&self, virtual_address: u32) -> Vec<u8> {
        let layout = SectionLayout::of(&self.root);
        let data_start = layout.tables + layout.strings + layout.descriptions;

        let mut tables = Vec::with_capacity(layout.tables as usize);
        let mut strings = Vec::with_capacity(layout.strings as usize);
        let mut descriptions = Vec::with_capacity(layout.descriptions as usize);
        let mut data = Vec::with_capacity(layout.data as usize);

        // tables are emitted breadth-first, in the same order their offsets are handed out
        let mut queue = VecDeque::from([&self.root]);
        let mut next_table_offset = self.root.table_size();
        while let Some(table) = queue.pop_front() {
            let mut header = table.data;
            header.number_of_name_entries = table.name_entry_count();
            header.number_of_id_entries = table.entries.len() as u16 - header.number_of_name_entries;
            tables.extend_from_slice(header.as_bytes());

            for (name, entry) in &table.entries {
                let name_offset_or_integer_id = match name {
                    ResourceEntryName::ID(id) => *id,
                    ResourceEntryName::Name(units) => {
                        let offset = layout.tables + strings.len() as u32;
                        write_u16(&mut strings, units.len() as u16);
                        units.iter().for_each(|unit| write_u16(&mut strings, *unit));
                        offset | SUBDIRECTORY_FLAG
                    }
                };
                let data_entry_or_subdirectory_offset = match entry {
                    ResourceEntry::Table(child) => {
                        let offset = next_table_offset;
                        next_table_offset += child.table_size();
                        queue.push_back(child);
                        offset | SUBDIRECTORY_FLAG
                    }
                    ResourceEntry::Data(resource) => {
                        let offset = layout.tables + layout.strings + descriptions.len() as u32;
                        data.resize(aligned_to(data.len(), DATA_ALIGNMENT as usize), 0);
                        let description = ResourceDataEntry {
                            data_rva: virtual_address + data_start + data.len() as u32,
                            size:     resource.data.len() as u32,
                            codepage: resource.codepage,
                            reserved: resource.reserved,
                        };
                        descriptions.extend_from_slice(description.as_bytes());
                        data.extend_from_slice(&resource.data);
                        offset
                    }
                };
                let entry = ResourceDirectoryEntry {
                    name_offset_or_integer_id,
                    data_entry_or_subdirectory_offset,
                };
                tables.extend_from_slice(entry.as_bytes());
            }
        }
        strings.resize(layout.strings as usize, 0);

        let mut section = tables;
        section.extend(strings);
        section.extend(descriptions);
        section.extend(data);
        section
    }
}

/// Sizes of the four consecutive regions of a built resource section.
struct SectionLayout {
    tables:       u32,
    strings:      u32,
    descriptions: u32,
    data:         u32,
}
impl SectionLayout {
    fn of(root: &ResourceTable) -> Self {
        let mut layout = SectionLayout {
            tables:       0,
            strings:      0,
            descriptions: 0,
            data:         0,
        };
        let mut queue = VecDeque::from([root]);
        while let Some(table) = queue.pop_front() {
            layout.tables += table.table_size();
            for (name, entry) in &table.entries {
                layout.strings += name.string_size();
                match entry {
                    ResourceEntry::Table(child) => queue.push_back(child),
                    ResourceEntry::Data(resource) => {
                        layout.descriptions += DESCRIPTION_SIZE;
                        layout.data = aligned_to(layout.data, DATA_ALIGNMENT)
                            + resource.data.len() as u32;
                    }
                }
            }
        }
        // keeps the descriptions and the data region aligned
        layout.strings = aligned_to(layout.strings, DATA_ALIGNMENT);
        layout
    }

    fn total(&self) -> u64 {
        self.tables as u64 + self.strings as u64 + self.descriptions as u64 + self.data as u64
    }
}

/// Portable executable resource table.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceTable {
    pub(crate) data:    ResourceDirectoryTable,
    pub(crate) entries: IndexMap<ResourceEntryName, ResourceEntry, RandomState>,
}
impl ResourceTable {
    fn parse(
        image: &[u8], base_address: u32, virtual_address: u32, directory_offset: u32, level: usize,
        visited: &mut Vec<u32>,
    ) -> Result<Self, ImageReadError> {
        if level >= MAX_DEPTH {
            return Err(ImageReadError::InvalidResourceTable(format!(
                "table at {:#x} nested too deeply",
                directory_offset
            )));
        }
        // each table may be parsed only once
        if visited.contains(&directory_offset) {
            return Err(ImageReadError::InvalidResourceTable(format!(
                "table at {:#x} referenced more than once",
                directory_offset
            )));
        }
        visited.push(directory_offset);
        let table_offset = base_address as usize + directory_offset as usize;
        let table = read_at::<ResourceDirectoryTable>(image, table_offset)?;
        trace!("{} {:#x?}", "--".repeat(level + 1), table);

        let count = table.number_of_name_entries as usize + table.number_of_id_entries as usize;
        let mut entries = IndexMap::with_capacity_and_hasher(count, RandomState::new());
        for index in 0..count {
            let entry_offset = table_offset + (TABLE_SIZE + ENTRY_SIZE * index as u32) as usize;
            let entry = read_at::<ResourceDirectoryEntry>(image, entry_offset)?;
            trace!("{} {:#x?}", "--".repeat(level + 1), entry);

            let name =
                ResourceEntryName::parse(image, base_address, entry.name_offset_or_integer_id)?;
            let target = entry.data_entry_or_subdirectory_offset;
            if target & SUBDIRECTORY_FLAG != 0 {
                let child = ResourceTable::parse(
                    image,
                    base_address,
                    virtual_address,
                    target ^ SUBDIRECTORY_FLAG,
                    level + 1,
                    visited,
                )?;
                entries.insert(name, ResourceEntry::Table(child));
                continue;
            }

            let description =
                read_at::<ResourceDataEntry>(image, base_address as usize + target as usize)?;
            let data_rva = description.data_rva;
            let size = description.size;
            if data_rva < virtual_address {
                warn!(
                    "{} resource data at {:#x?} lies before the resource section at {:#x?}, skipping",
                    "--".repeat(level + 1),
                    data_rva,
                    virtual_address
                );
                continue;
            }
            let start = base_address as u64 + (data_rva - virtual_address) as u64;
            let end = start + size as u64;
            if end > image.len() as u64 {
                warn!(
                    "{} resource data {:#x?}..{:#x?} outside valid range ({:#x?}), skipping",
                    "--".repeat(level + 1),
                    start,
                    end,
                    image.len()
                );
                continue;
            }
            entries.insert(
                name,
                ResourceEntry::Data(ResourceData {
                    data:     image[start as usize..end as usize].to_vec().into(),
                    codepage: description.codepage,
                    reserved: description.reserved,
                }),
            );
        }
        entries.sort_by(|a, _, b, _| a.directory_order(b));

        Ok(Self {
            data: table,
            entries,
        })
    }

    /// Get a resource entry from the table.
    pub fn get<N: Borrow<ResourceEntryName>>(&self, name: N) -> Option<&ResourceEntry> {
        self.entries.get(name.borrow())
    }

    /// Get a mutable resource entry from the table.
    pub fn get_mut<N: Borrow<ResourceEntryName>>(&mut self, name: N) -> Option<&mut ResourceEntry> {
        self.entries.get_mut(name.borrow())
    }

    /// Insert a resource entry into the table.
    /// If an entry with the given name already exists, it will be replaced in place.
    /// New entries are inserted in directory order, named entries first and ids ascending.
    ///
    /// # Returns
    /// The replaced entry.
    pub fn insert<N: Borrow<ResourceEntryName>>(
        &mut self, name: N, entry: ResourceEntry,
    ) -> Option<ResourceEntry> {
        let previous = self.entries.insert(name.borrow().clone(), entry);
        if previous.is_none() {
            self.entries.sort_by(|a, _, b, _| a.directory_order(b));
        }
        previous
    }

    /// Remove a resource entry from the table.
    ///
    /// # Returns
    /// The removed entry.
    pub fn remove<N: Borrow<ResourceEntryName>>(&mut self, name: N) -> Option<ResourceEntry> {
        self.entries.shift_remove(name.borrow())
    }

    /// Returns the entry names in the table.
    pub fn entries(&self) -> Vec<&ResourceEntryName> { self.entries.keys().collect() }

    /// Returns the child table with the given name, replacing a data entry or creating the table if required.
    fn table_entry(&mut self, name: ResourceEntryName) -> &mut ResourceTable {
        if !matches!(self.entries.get(&name), Some(ResourceEntry::Table(_))) {
            self.insert(&name, ResourceEntry::Table(ResourceTable::default()));
        }
        match self.entries.get_mut(&name) {
            Some(ResourceEntry::Table(table)) => table,
            _ => unreachable!("table entry was just inserted"),
        }
    }

    fn table_size(&self) -> u32 { TABLE_SIZE + self.entries.len() as u32 * ENTRY_SIZE }

    fn name_entry_count(&self) -> u16 {
        self.entries.keys().filter(|name| matches!(name, ResourceEntryName::Name(_))).count()
            as u16
    }
}

/// Raw resource data.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceData {
    data:     DebugIgnore<Vec<u8>>,
    codepage: u32,
    reserved: u32,
}
impl ResourceData {
    /// Create resource data with the default codepage.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data:     data.into(),
            codepage: 0,
            reserved: 0,
        }
    }

    /// Returns the raw data.
    pub fn data(&self) -> &[u8] { &self.data }

    /// Returns the codepage of the data.
    pub fn codepage(&self) -> u32 { self.codepage }

    /// Set the raw data.
    pub fn set_data(&mut self, data: Vec<u8>) { self.data = data.into(); }
}

/// Resource entry in a resource table.
/// This can be either a child table or raw data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResourceEntry {
    Table(ResourceTable),
    Data(ResourceData),
}
impl ResourceEntry {
    pub fn as_table(&self) -> Option<&ResourceTable> {
        match self {
            ResourceEntry::Table(table) => Some(table),
            ResourceEntry::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&ResourceData> {
        match self {
            ResourceEntry::Table(_) => None,
            ResourceEntry::Data(data) => Some(data),
        }
    }

    pub fn into_data(self) -> Option<ResourceData> {
        match self {
            ResourceEntry::Table(_) => None,
            ResourceEntry::Data(data) => Some(data),
        }
    }
}

/// Resource directory entry name.
/// This can either be a raw id or a name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResourceEntryName {
    ID(u32),
    // UTF-16 code units without the length prefix
    Name(Vec<u16>),
}
impl ResourceEntryName {
    fn parse(image: &[u8], base_address: u32, id: u32) -> Result<Self, ReadError> {
        if id & SUBDIRECTORY_FLAG == 0 {
            return Ok(Self::ID(id));
        }
        let address = base_address as usize + (id ^ SUBDIRECTORY_FLAG) as usize;
        let length = read_u16(image, address)? as usize;
        trace!("reading resource name at {:#x?} ({} characters)", address, length);
        let units = (0..length)
            .map(|index| read_u16(image, address + 2 + index * 2))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Name(units))
    }

    pub fn from_string<S: AsRef<str>>(string: S) -> Self {
        Self::Name(string.as_ref().encode_utf16().collect())
    }

    pub fn to_string(&self) -> Option<String> {
        match self {
            Self::ID(_) => None,
            Self::Name(units) => Some(String::from_utf16_lossy(units)),
        }
    }

    /// Order in which the loader expects entries: names first, compared case-insensitively, then ids ascending.
    fn directory_order(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Name(a), Self::Name(b)) => {
                let upper = |unit: &u16| match *unit {
                    unit @ 0x61..=0x7a => unit - 0x20,
                    unit => unit,
                };
                a.iter().map(upper).cmp(b.iter().map(upper))
            }
            (Self::Name(_), Self::ID(_)) => Ordering::Less,
            (Self::ID(_), Self::Name(_)) => Ordering::Greater,
            (Self::ID(a), Self::ID(b)) => a.cmp(b),
        }
    }

    fn string_size(&self) -> u32 {
        match self {
            Self::ID(_) => 0,
            Self::Name(units) => 2 + units.len() as u32 * 2,
        }
    }
}
