//! Conversion of icon containers into icon group and icon image resources.
//!
//! An icon container (`.ico` file) stores a directory of images followed by the image data, addressed by file offset.
//! Embedded in an executable the same images become one `RT_ICON` resource each,
//! and the directory becomes an `RT_GROUP_ICON` resource that references the images by resource id.
//!
//! See <https://learn.microsoft.com/en-us/previous-versions/ms997538(v=msdn.10)> for more information.

use alloc::vec::Vec;

use log::{debug, trace};

use crate::{constants::*, errors::*, util::*};

/// Directory entry of an image in an icon container.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct IconImage {
    pub width:       u8,
    pub height:      u8,
    pub color_count: u8,
    pub reserved:    u8,
    pub planes:      u16,
    pub bit_count:   u16,
    pub bytes:       u32,
    pub offset:      u32,
}
impl IconImage {
    fn read(data: &[u8], offset: usize) -> Result<Self, ReadError> {
        Ok(Self {
            width:       read_u8(data, offset)?,
            height:      read_u8(data, offset + 1)?,
            color_count: read_u8(data, offset + 2)?,
            reserved:    read_u8(data, offset + 3)?,
            planes:      read_u16(data, offset + 4)?,
            bit_count:   read_u16(data, offset + 6)?,
            bytes:       read_u32(data, offset + 8)?,
            offset:      read_u32(data, offset + 12)?,
        })
    }
}

/// Parsed icon container.
///
/// Borrows the container bytes, every image is guaranteed to lie within them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IconDirectory<'a> {
    data:   &'a [u8],
    images: Vec<IconImage>,
}
impl<'a> IconDirectory<'a> {
    /// Parse an icon container.
    ///
    /// # Returns
    /// Returns an error if the header is truncated or invalid, the container is a cursor, holds no images,
    /// or an image lies outside the container.
    pub fn parse(data: &'a [u8]) -> Result<Self, IconError> {
        if data.len() < ICON_HEADER_SIZE {
            return Err(IconError::Truncated(data.len()));
        }
        let truncated = |_: ReadError| IconError::Truncated(data.len());
        let reserved = read_u16(data, 0).map_err(truncated)?;
        let type_ = read_u16(data, 2).map_err(truncated)?;
        let count = read_u16(data, 4).map_err(truncated)? as usize;
        trace!("icon container: reserved {}, type {}, count {}", reserved, type_, count);

        if reserved != 0 {
            return Err(IconError::InvalidReserved(reserved));
        }
        if type_ != ICON_CONTAINER_TYPE_ICON {
            return Err(IconError::InvalidType(type_));
        }
        if count == 0 {
            return Err(IconError::Empty);
        }
        if data.len() < ICON_HEADER_SIZE + count * ICON_FILE_ENTRY_SIZE {
            return Err(IconError::Truncated(data.len()));
        }

        let mut images = Vec::with_capacity(count);
        for index in 0..count {
            let image = IconImage::read(data, ICON_HEADER_SIZE + index * ICON_FILE_ENTRY_SIZE)
                .map_err(truncated)?;
            trace!("icon image {}: {:?}", index, image);
            if image.offset as u64 + image.bytes as u64 > data.len() as u64 {
                return Err(IconError::ImageOutOfBounds {
                    index,
                    offset: image.offset,
                    length: image.bytes,
                    size: data.len(),
                });
            }
            images.push(image);
        }

        Ok(Self { data, images })
    }

    /// Returns the directory entries in container order.
    pub fn images(&self) -> &[IconImage] { &self.images }

    /// Returns the number of images.
    pub fn len(&self) -> usize { self.images.len() }

    /// Returns whether the directory holds no images, which a parsed directory never does.
    pub fn is_empty(&self) -> bool { self.images.is_empty() }

    /// Returns the raw data of the image at the index.
    pub fn image_data(&self, index: usize) -> Option<&'a [u8]> {
        let image = self.images.get(index)?;
        let start = image.offset as usize;
        self.data.get(start..start + image.bytes as usize)
    }

    /// Convert the directory into an icon group record and one icon image record per image.
    ///
    /// Images are assigned the resource ids `1..=N` in container order,
    /// which is the order the shell picks preferred images in.
    pub fn to_group_record(&self) -> (GroupIconRecord, Vec<IconResource>) {
        let mut entries = Vec::with_capacity(self.images.len());
        let mut resources = Vec::with_capacity(self.images.len());
        for (index, image) in self.images.iter().enumerate() {
            let id = ICON_IMAGE_BASE_ID + index as u16;
            let start = image.offset as usize;
            resources.push(IconResource {
                id,
                data: self.data[start..start + image.bytes as usize].to_vec(),
            });
            entries.push(GroupIconEntry {
                width: image.width,
                height: image.height,
                color_count: image.color_count,
                reserved: image.reserved,
                planes: image.planes,
                bit_count: image.bit_count,
                bytes: image.bytes,
                id,
            });
        }
        debug!("converted icon container with {} images", entries.len());
        (GroupIconRecord { entries }, resources)
    }
}

/// Raw image data of a single icon image resource.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IconResource {
    pub id:   u16,
    pub data: Vec<u8>,
}

/// Directory entry of an image in an icon group resource.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct GroupIconEntry {
    pub width:       u8,
    pub height:      u8,
    pub color_count: u8,
    pub reserved:    u8,
    pub planes:      u16,
    pub bit_count:   u16,
    pub bytes:       u32,
    pub id:          u16,
}

/// Icon group resource, the directory of an icon referencing its images by resource id.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct GroupIconRecord {
    entries: Vec<GroupIconEntry>,
}
impl GroupIconRecord {
    /// Parse an icon group resource.
    pub fn parse(data: &[u8]) -> Result<Self, ResourceError> {
        let type_ = read_u16(data, 2)?;
        if type_ != ICON_CONTAINER_TYPE_ICON {
            return Err(ResourceError::InvalidRecord(alloc::format!(
                "icon group has type {}",
                type_
            )));
        }
        let count = read_u16(data, 4)? as usize;
        let entries = (0..count)
            .map(|index| {
                let offset = ICON_HEADER_SIZE + index * ICON_GROUP_ENTRY_SIZE;
                Ok(GroupIconEntry {
                    width:       read_u8(data, offset)?,
                    height:      read_u8(data, offset + 1)?,
                    color_count: read_u8(data, offset + 2)?,
                    reserved:    read_u8(data, offset + 3)?,
                    planes:      read_u16(data, offset + 4)?,
                    bit_count:   read_u16(data, offset + 6)?,
                    bytes:       read_u32(data, offset + 8)?,
                    id:          read_u16(data, offset + 12)?,
                })
            })
            .collect::<Result<Vec<_>, ReadError>>()?;
        Ok(Self { entries })
    }

    /// Returns the entries in resource id order.
    pub fn entries(&self) -> &[GroupIconEntry] { &self.entries }

    /// Build the icon group resource data.
    pub fn build(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(ICON_HEADER_SIZE + self.entries.len() * ICON_GROUP_ENTRY_SIZE);
        write_u16(&mut data, 0);
        write_u16(&mut data, ICON_CONTAINER_TYPE_ICON);
        write_u16(&mut data, self.entries.len() as u16);
        for entry in &self.entries {
            data.extend_from_slice(&[entry.width, entry.height, entry.color_count, entry.reserved]);
            write_u16(&mut data, entry.planes);
            write_u16(&mut data, entry.bit_count);
            write_u32(&mut data, entry.bytes);
            write_u16(&mut data, entry.id);
        }
        data
    }
}
