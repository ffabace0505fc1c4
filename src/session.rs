//! Update sessions applying resource records to an executable file.

use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use debug_ignore::DebugIgnore;
use log::{debug, trace};
use tempfile::NamedTempFile;

use crate::{errors::*, image::*, resource::*};

/// Resource record applied to an executable, identified by resource type, id and language.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResourceRecord {
    pub resource_type: u16,
    pub id:            u16,
    pub language:      u16,
    pub data:          Vec<u8>,
}
impl ResourceRecord {
    pub fn new(resource_type: u16, id: u16, language: u16, data: Vec<u8>) -> Self {
        Self {
            resource_type,
            id,
            language,
            data,
        }
    }

    /// Returns the identifying resource type, id and language.
    pub fn key(&self) -> (u16, u16, u16) { (self.resource_type, self.id, self.language) }
}

/// Session holding exclusive access to an executable while resources are updated.
///
/// Updates become visible in the file only when the session is ended with `commit` set,
/// and either all of them are applied or none.
pub trait UpdateSession: Sized {
    /// Begin a session on the executable at the path.
    fn begin(path: &Path) -> Result<Self, SessionError>;

    /// Add or replace a resource.
    fn update(&mut self, record: &ResourceRecord) -> Result<(), SessionError>;

    /// End the session, writing all updates to the file if `commit` is set or discarding them otherwise.
    fn end(self, commit: bool) -> Result<(), SessionError>;
}

/// Update session rewriting the resource section of the image.
///
/// The file is locked for the lifetime of the session. Committing writes the rebuilt image to a temporary file
/// next to the target and renames it over the target, so the target is either fully updated or untouched.
#[derive(Debug)]
pub struct ImageSession {
    path:      PathBuf,
    file:      File,
    data:      DebugIgnore<Vec<u8>>,
    resources: ResourceDirectory,
}
impl ImageSession {
    /// Returns the resource directory including all updates of the session.
    pub fn resource_directory(&self) -> &ResourceDirectory { &self.resources }
}
impl UpdateSession for ImageSession {
    fn begin(path: &Path) -> Result<Self, SessionError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(SessionError::Locked(path.to_path_buf())),
            Err(TryLockError::Error(error)) => return Err(error.into()),
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let resources = {
            let image = Image::parse(data.as_slice())?;
            if image.data_directory(DataDirectoryType::ResourceTable).is_none() {
                return Err(ImageReadError::InvalidHeader(
                    "image has no resource data directory entry".into(),
                )
                .into());
            }
            image.resource_directory().cloned().unwrap_or_default()
        };
        debug!("began update session on {} ({} bytes)", path.display(), data.len());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            data: data.into(),
            resources,
        })
    }

    fn update(&mut self, record: &ResourceRecord) -> Result<(), SessionError> {
        trace!("updating resource {:?} ({} bytes)", record.key(), record.data.len());
        self.resources
            .set(record.resource_type, record.id, record.language, record.data.clone());
        Ok(())
    }

    fn end(self, commit: bool) -> Result<(), SessionError> {
        let Self {
            path,
            file,
            data,
            resources,
        } = self;
        if !commit {
            debug!("discarding update session on {}", path.display());
            file.unlock()?;
            return Ok(());
        }

        let mut image = Image::parse(data.as_slice())?;
        image.set_resource_directory(resources)?;

        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temporary = NamedTempFile::new_in(directory)?;
        temporary.write_all(image.data())?;
        temporary.as_file().set_permissions(file.metadata()?.permissions())?;
        temporary.as_file().sync_all()?;

        // the target has to be closed before it can be replaced on windows
        #[cfg(windows)]
        {
            file.unlock()?;
            drop(file);
        }
        temporary.persist(&path).map_err(|error| error.error)?;
        #[cfg(not(windows))]
        file.unlock()?;
        debug!("committed update session on {} ({} bytes)", path.display(), image.data().len());
        Ok(())
    }
}

#[cfg(windows)]
pub use native::NativeSession;

#[cfg(windows)]
mod native {
    use std::{io, os::windows::ffi::OsStrExt, path::Path, ptr};

    use log::{debug, warn};
    use winapi::{
        shared::minwindef::{DWORD, FALSE, LPVOID, TRUE},
        um::{
            winbase::{BeginUpdateResourceW, EndUpdateResourceW, UpdateResourceW},
            winnt::{HANDLE, LPCWSTR},
        },
    };

    use super::{ResourceRecord, UpdateSession};
    use crate::errors::*;

    /// Update session using the resource update functions of the operating system.
    #[derive(Debug)]
    pub struct NativeSession {
        handle: HANDLE,
    }
    impl UpdateSession for NativeSession {
        fn begin(path: &Path) -> Result<Self, SessionError> {
            let path = path.as_os_str().encode_wide().chain(Some(0)).collect::<Vec<u16>>();
            let handle = unsafe { BeginUpdateResourceW(path.as_ptr(), FALSE) };
            if handle.is_null() {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { handle })
        }

        fn update(&mut self, record: &ResourceRecord) -> Result<(), SessionError> {
            // integer resource types and names are passed in place of string pointers
            let updated = unsafe {
                UpdateResourceW(
                    self.handle,
                    record.resource_type as usize as LPCWSTR,
                    record.id as usize as LPCWSTR,
                    record.language,
                    record.data.as_ptr() as LPVOID,
                    record.data.len() as DWORD,
                )
            };
            if updated == FALSE {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        fn end(mut self, commit: bool) -> Result<(), SessionError> {
            let handle = std::mem::replace(&mut self.handle, ptr::null_mut());
            let discard = if commit { FALSE } else { TRUE };
            if unsafe { EndUpdateResourceW(handle, discard) } == FALSE {
                return Err(io::Error::last_os_error().into());
            }
            debug!("ended native update session, commit: {}", commit);
            Ok(())
        }
    }
    impl Drop for NativeSession {
        fn drop(&mut self) {
            if !self.handle.is_null() {
                warn!("native update session dropped without ending, discarding");
                unsafe { EndUpdateResourceW(self.handle, TRUE) };
            }
        }
    }
}
