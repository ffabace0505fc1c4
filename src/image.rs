//! Portable executable image representation.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format> for more information.

use alloc::{borrow::Cow, vec::Vec};

use ahash::RandomState;
use indexmap::IndexMap;
use log::{debug, warn};
use zerocopy::IntoBytes;

use crate::{constants::*, errors::*, resource::*, types::*, util::*};

const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const DATA_DIRECTORY_SIZE: usize = 8;

/// Image data directory type enumeration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DataDirectoryType {
    ExportTable,
    ImportTable,
    ResourceTable,
    ExceptionTable,
    CertificateTable,
    BaseRelocationTable,
    Debug,
    Architecture,
    GlobalPtr,
    TLSTable,
    LoadConfigTable,
    BoundImport,
    IAT,
    DelayImportDescriptor,
    CLRRuntimeHeader,
    Reserved,
}
impl DataDirectoryType {
    const ALL: [DataDirectoryType; 16] = [
        Self::ExportTable,
        Self::ImportTable,
        Self::ResourceTable,
        Self::ExceptionTable,
        Self::CertificateTable,
        Self::BaseRelocationTable,
        Self::Debug,
        Self::Architecture,
        Self::GlobalPtr,
        Self::TLSTable,
        Self::LoadConfigTable,
        Self::BoundImport,
        Self::IAT,
        Self::DelayImportDescriptor,
        Self::CLRRuntimeHeader,
        Self::Reserved,
    ];
}

/// Where a rebuilt resource directory is placed in the image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Placement {
    /// Overwrite the existing resource section, the new directory fits into it.
    InPlace(usize),
    /// Grow the existing resource section, it is the last section of the image.
    Extend(usize),
    /// Add a new section after all other sections.
    Append,
}

/// Portable executable image representation.
///
/// Holds the raw image data and the parsed headers required to locate and replace the resource directory.
#[derive(Debug, Clone)]
pub struct Image<'a> {
    pub(crate) image: Cow<'a, [u8]>,

    pub(crate) coff_header:           CoffHeader,
    pub(crate) windows_header:        GenericWindowsHeader,
    pub(crate) header_data_directory: IndexMap<DataDirectoryType, ImageDataDirectory, RandomState>,
    pub(crate) section_table:         Vec<SectionHeader>,

    pub(crate) resource_directory: Option<ResourceDirectory>,

    coff_header_offset:        usize,
    windows_header_offset:     usize,
    optional_header_dd_offset: usize,
    section_table_offset:      usize,
}

impl<'a> Image<'a> {
    /// Parse a portable executable image from a byte slice.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the byte slice is not a valid portable executable image or is missing required headers.
    pub fn parse<R: Into<Cow<'a, [u8]>>>(image: R) -> Result<Self, ImageReadError> {
        let image = image.into();

        let pe_dos_magic = read_u16(&image, 0)?;
        debug!("pe_dos_magic: {:#x?}", pe_dos_magic);
        if pe_dos_magic != PE_DOS_MAGIC {
            return Err(ImageReadError::InvalidHeader("no dos magic".into()));
        }

        let pe_signature_offset = read_u32(&image, PE_PTR_OFFSET as usize)? as usize;
        let pe_signature = read_u32(&image, pe_signature_offset)?;
        debug!("{:#x?}: pe_signature: {:#x?}", pe_signature_offset, pe_signature);
        if pe_signature != PE_NT_SIGNATURE {
            return Err(ImageReadError::InvalidHeader("no pe signature".into()));
        }

        let coff_header_offset = pe_signature_offset + 4;
        let coff_header = read_at::<CoffHeader>(&image, coff_header_offset)?;
        debug!("{:#x?}: {:#x?}", coff_header_offset, coff_header);

        let standard_header_offset = coff_header_offset + COFF_HEADER_SIZE;
        let magic = read_u16(&image, standard_header_offset)?;
        debug!("{:#x?}: optional header magic: {:#x?}", standard_header_offset, magic);

        let size_of_optional_header = coff_header.size_of_optional_header as usize;
        let (windows_header_offset, windows_header, optional_header_dd_offset) =
            if magic == PE_32_MAGIC && size_of_optional_header >= 96 {
                let offset = standard_header_offset + 28;
                let header = read_at::<WindowsHeader<u32>>(&image, offset)?;
                (offset, GenericWindowsHeader::WindowsHeader32(header), standard_header_offset + 96)
            } else if magic == PE_64_MAGIC && size_of_optional_header >= 112 {
                let offset = standard_header_offset + 24;
                let header = read_at::<WindowsHeader<u64>>(&image, offset)?;
                (offset, GenericWindowsHeader::WindowsHeader64(header), standard_header_offset + 112)
            } else {
                return Err(ImageReadError::InvalidHeader("invalid optional header".into()));
            };
        debug!("{:#x?}: {:#x?}", windows_header_offset, windows_header);

        if windows_header.section_alignment() == 0 || windows_header.file_alignment() == 0 {
            return Err(ImageReadError::InvalidHeader("zero section or file alignment".into()));
        }

        let directory_space = standard_header_offset + size_of_optional_header - optional_header_dd_offset;
        let directory_count = (windows_header.number_of_rva_and_sizes() as usize)
            .min(DataDirectoryType::ALL.len())
            .min(directory_space / DATA_DIRECTORY_SIZE);
        let mut header_data_directory =
            IndexMap::<DataDirectoryType, ImageDataDirectory, _>::with_hasher(RandomState::new());
        for (index, &directory) in DataDirectoryType::ALL[..directory_count].iter().enumerate() {
            let offset = optional_header_dd_offset + index * DATA_DIRECTORY_SIZE;
            let data = read_at::<ImageDataDirectory>(&image, offset)?;
            debug!("{:#x?}: {:?}: {:#x?}", offset, directory, data);
            header_data_directory.insert(directory, data);
        }

        let section_table_offset = standard_header_offset + size_of_optional_header;
        let section_table = (0..coff_header.number_of_sections as usize)
            .map(|index| {
                read_at::<SectionHeader>(&image, section_table_offset + index * SECTION_HEADER_SIZE)
            })
            .collect::<Result<Vec<_>, _>>()?;
        for section in &section_table {
            debug!("{}: {:#x?}", section.name().unwrap_or("?"), section);
        }

        let mut resource_directory = None;
        if let Some(resource_data) = header_data_directory.get(&DataDirectoryType::ResourceTable) {
            let virtual_address = resource_data.virtual_address;
            if virtual_address > 0 && resource_data.size > 0 {
                if let Some(section) =
                    section_table.iter().find(|section| section.contains_rva(virtual_address))
                {
                    debug!("found resource directory in {} section", section.name().unwrap_or("?"));
                    // the directory does not have to start at the beginning of its section
                    let base_address =
                        section.pointer_to_raw_data + (virtual_address - section.virtual_address);
                    resource_directory =
                        Some(ResourceDirectory::parse(&image, base_address, virtual_address)?);
                } else {
                    warn!("resource directory at {:#x?} is outside of all sections", virtual_address);
                }
            }
        }

        Ok(Self {
            image,
            coff_header,
            windows_header,
            header_data_directory,
            section_table,
            resource_directory,
            coff_header_offset,
            windows_header_offset,
            optional_header_dd_offset,
            section_table_offset,
        })
    }

    /// Set the resource directory of the image.
    ///
    /// This will update the resource data directory, the section table and the image size.
    /// The existing resource section is rewritten in place if it is only used by the resource directory and either
    /// the new directory fits into it or it is the last section of the image and can be grown.
    /// Otherwise the existing section is kept intact and a new section is added after all other sections.
    /// Data appended after the last section is preserved.
    ///
    /// # Returns
    /// Returns the previous resource directory, or an error in the following cases:
    /// - There is not enough space in the image header to add a new section.
    /// - A section points to data outside the image.
    /// - The image has no data directory entry for the resource table.
    ///
    /// The image is left unchanged if an error is returned.
    pub fn set_resource_directory(
        &mut self, resource_directory: ResourceDirectory,
    ) -> Result<Option<ResourceDirectory>, ImageWriteError> {
        if !self.header_data_directory.contains_key(&DataDirectoryType::ResourceTable) {
            return Err(ImageWriteError::MissingResourceDataDirectory);
        }
        let size = resource_directory.size();
        if size > u32::MAX as u64 / 2 {
            return Err(ImageWriteError::ResourceDirectoryTooLarge(size));
        }
        let size = size as u32;

        let sections_end = self.sections_end()?;
        let placement = self.placement(size);
        debug!("new resource directory size: {:#x?}, placement: {:?}", size, placement);

        let file_alignment = self.windows_header.file_alignment();
        let section_alignment = self.windows_header.section_alignment();
        let mut section_table = self.section_table.clone();
        let mut coff_header = self.coff_header;
        let mut header_data_directory = self.header_data_directory.clone();

        let mut new_image;
        let virtual_address;
        match placement {
            Placement::InPlace(index) => {
                let section = &mut section_table[index];
                virtual_address = section.virtual_address;
                let mut data = resource_directory.build(virtual_address);
                data.resize(section.size_of_raw_data as usize, 0);
                section.virtual_size = size;

                let start = section.pointer_to_raw_data as usize;
                new_image = self.image.to_vec();
                new_image[start..start + data.len()].copy_from_slice(&data);
            }
            Placement::Extend(index) => {
                let section = &mut section_table[index];
                virtual_address = section.virtual_address;
                let mut data = resource_directory.build(virtual_address);
                data.resize(aligned_to(size, file_alignment) as usize, 0);
                let start = section.pointer_to_raw_data as usize;
                let end = section.raw_end() as usize;
                section.size_of_raw_data = data.len() as u32;
                section.virtual_size = size;

                new_image = Vec::with_capacity(start + data.len() + self.image.len() - end);
                new_image.extend_from_slice(&self.image[..start]);
                new_image.extend_from_slice(&data);
                new_image.extend_from_slice(&self.image[end..]);
            }
            Placement::Append => {
                let headers_end =
                    self.section_table_offset + (section_table.len() + 1) * SECTION_HEADER_SIZE;
                if headers_end > self.first_section_start() {
                    return Err(ImageWriteError::NotEnoughSpaceInHeader);
                }
                virtual_address = aligned_to(
                    section_table
                        .iter()
                        .map(|section| section.virtual_end() as u32)
                        .max()
                        .unwrap_or(section_alignment),
                    section_alignment,
                );
                let pointer_to_raw_data = aligned_to(sections_end as u32, file_alignment);
                let mut data = resource_directory.build(virtual_address);
                data.resize(aligned_to(size, file_alignment) as usize, 0);

                section_table.push(SectionHeader {
                    name: u64::from_le_bytes(*IMAGE_RESOURCE_SECTION_NAME),
                    virtual_size: size,
                    virtual_address,
                    size_of_raw_data: data.len() as u32,
                    pointer_to_raw_data,
                    characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
                    ..SectionHeader::default()
                });
                coff_header.number_of_sections += 1;

                new_image = Vec::with_capacity(pointer_to_raw_data as usize + data.len());
                new_image.extend_from_slice(&self.image[..sections_end]);
                new_image.resize(pointer_to_raw_data as usize, 0);
                new_image.extend_from_slice(&data);
                new_image.extend_from_slice(&self.image[sections_end..]);
            }
        }

        if let Some(directory) = header_data_directory.get_mut(&DataDirectoryType::ResourceTable) {
            directory.virtual_address = virtual_address;
            directory.size = size;
        }
        if !matches!(placement, Placement::InPlace(_)) {
            // the certificate table is addressed by file offset and covers the old layout
            if let Some(certificate) =
                header_data_directory.get_mut(&DataDirectoryType::CertificateTable)
            {
                if certificate.size > 0 {
                    warn!("image signature is invalidated by the new layout and is removed");
                    *certificate = ImageDataDirectory::default();
                }
            }
        }

        let mut windows_header = self.windows_header;
        let size_of_image = section_table
            .iter()
            .map(|section| aligned_to(section.virtual_end() as u32, section_alignment))
            .max()
            .unwrap_or(self.windows_header.size_of_image());
        windows_header.set_size_of_image(size_of_image);

        let write = |image: &mut Vec<u8>, offset: usize, bytes: &[u8]| {
            image[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        write(&mut new_image, self.coff_header_offset, coff_header.as_bytes());
        write(&mut new_image, self.windows_header_offset, windows_header.as_bytes());
        for (index, directory) in header_data_directory.values().enumerate() {
            let offset = self.optional_header_dd_offset + index * DATA_DIRECTORY_SIZE;
            write(&mut new_image, offset, directory.as_bytes());
        }
        for (index, section) in section_table.iter().enumerate() {
            let offset = self.section_table_offset + index * SECTION_HEADER_SIZE;
            write(&mut new_image, offset, section.as_bytes());
        }

        self.coff_header = coff_header;
        self.windows_header = windows_header;
        self.header_data_directory = header_data_directory;
        self.section_table = section_table;
        self.image = new_image.into();

        let mut resource_directory = resource_directory;
        resource_directory.virtual_address = virtual_address;
        Ok(self.resource_directory.replace(resource_directory))
    }

    /// Decide where a resource directory of the given size is written.
    fn placement(&self, size: u32) -> Placement {
        let Some(index) = self.resource_section_index() else {
            return Placement::Append;
        };
        let section = &self.section_table[index];
        let shared = self.header_data_directory.iter().any(|(directory, data)| {
            *directory != DataDirectoryType::ResourceTable
                && *directory != DataDirectoryType::CertificateTable
                && data.size > 0
                && section.contains_rva(data.virtual_address)
        });
        if shared {
            warn!("resource section is shared with other data directories, which can indicate a packed executable");
            return Placement::Append;
        }
        let is_last = self.section_table.iter().all(|other| {
            other.raw_end() <= section.raw_end() && other.virtual_end() <= section.virtual_end()
        });
        // without a following section the virtual size can grow up to the raw size
        let capacity = if is_last {
            section.size_of_raw_data
        } else {
            let section_alignment = self.windows_header.section_alignment();
            section.size_of_raw_data.min(aligned_to(section.virtual_size, section_alignment))
        };
        if size <= capacity {
            return Placement::InPlace(index);
        }
        if is_last {
            Placement::Extend(index)
        } else {
            debug!("resource section is too small and followed by other sections");
            Placement::Append
        }
    }

    fn resource_section_index(&self) -> Option<usize> {
        let directory = self.header_data_directory.get(&DataDirectoryType::ResourceTable)?;
        if directory.size == 0 {
            return None;
        }
        self.section_table.iter().position(|section| {
            section.virtual_address == directory.virtual_address && section.size_of_raw_data > 0
        })
    }

    /// Returns the end of the last section data in the file.
    fn sections_end(&self) -> Result<usize, ImageWriteError> {
        let end = self
            .section_table
            .iter()
            .filter(|section| section.size_of_raw_data > 0)
            .map(SectionHeader::raw_end)
            .max()
            .unwrap_or(self.first_section_start() as u64);
        if end > self.image.len() as u64 {
            return Err(ImageWriteError::InvalidSectionRange(end, self.image.len() as u64));
        }
        Ok(end as usize)
    }

    /// Returns the start of the first section data in the file, which bounds the header space.
    fn first_section_start(&self) -> usize {
        self.section_table
            .iter()
            .filter(|section| section.size_of_raw_data > 0)
            .map(|section| section.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(self.image.len())
    }

    /// Returns the current resource directory or `None` if the image does not contain a resource directory.
    pub fn resource_directory(&self) -> Option<&ResourceDirectory> {
        self.resource_directory.as_ref()
    }

    /// Returns the raw image data with all changes applied.
    pub fn data(&self) -> &[u8] { &self.image }

    /// Returns the parsed coff header.
    pub fn coff_header(&self) -> &CoffHeader { &self.coff_header }

    /// Returns the parsed windows header.
    pub fn windows_header(&self) -> &GenericWindowsHeader { &self.windows_header }

    /// Returns the data directory for the requested header.
    pub fn data_directory(&self, directory: DataDirectoryType) -> Option<&ImageDataDirectory> {
        self.header_data_directory.get(&directory)
    }

    /// Returns the section header containing the data directory.
    pub fn section_header_for_data_directory(
        &self, directory: DataDirectoryType,
    ) -> Option<&SectionHeader> {
        let data_directory = self.data_directory(directory)?;
        self.section_table.iter().find(|section| section.contains_rva(data_directory.virtual_address))
    }

    /// Returns all section headers of the image.
    pub fn section_table(&self) -> &[SectionHeader] { &self.section_table }
}
