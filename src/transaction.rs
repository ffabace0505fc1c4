//! Transactions staging resource records and committing them to an executable as one unit.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::RandomState;
use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::{constants::*, errors::*, icon::*, session::*, version::*};

/// Result of finalizing a transaction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    /// All staged records were written to the executable.
    Committed { records: usize },
    /// No records were staged and the executable was not written.
    NothingStaged,
}

/// Resource transaction against an executable.
///
/// The transaction owns the update session for its whole lifetime. Records are collected while staging
/// and handed to the session only when the transaction is finalized, so a failure leaves the executable untouched.
/// A transaction dropped before it is finalized discards its session.
///
/// # Examples
/// ```
/// use respatch::{ResourceTransaction, VersionInfo};
///
/// let mut transaction = ResourceTransaction::open("app.exe")?;
/// transaction.stage_icon_file("app.ico")?;
/// let mut version_info = VersionInfo::default();
/// version_info.set_file_version("1.2.3");
/// transaction.stage_version_info(&version_info)?;
/// transaction.finalize()?;
/// ```
#[derive(Debug)]
pub struct ResourceTransaction<S: UpdateSession = ImageSession> {
    path:    PathBuf,
    session: Option<S>,
    staged:  IndexMap<(u16, u16, u16), ResourceRecord, RandomState>,
}

impl ResourceTransaction<ImageSession> {
    /// Open a transaction on the executable at the path.
    ///
    /// # Returns
    /// Returns a session error if the file can't be opened, is locked by another session or is not a valid executable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransactionError> { Self::begin(path) }
}

impl<S: UpdateSession> ResourceTransaction<S> {
    /// Open a transaction on the executable at the path using the session type `S`.
    pub fn begin<P: AsRef<Path>>(path: P) -> Result<Self, TransactionError> {
        let path = path.as_ref();
        let session = S::begin(path).map_err(TransactionError::Session)?;
        Ok(Self::with_session(path, session))
    }

    /// Create a transaction owning an already started session.
    pub fn with_session<P: AsRef<Path>>(path: P, session: S) -> Self {
        debug!("opened resource transaction on {}", path.as_ref().display());
        Self {
            path:    path.as_ref().to_path_buf(),
            session: Some(session),
            staged:  IndexMap::default(),
        }
    }

    /// Returns the path of the executable.
    pub fn path(&self) -> &Path { &self.path }

    /// Returns the number of distinct records staged.
    /// Staging a record with the type, id and language of an already staged record replaces it.
    pub fn staged_count(&self) -> usize { self.staged.len() }

    /// Returns the staged records in staging order.
    pub fn staged(&self) -> impl Iterator<Item = &ResourceRecord> { self.staged.values() }

    /// Returns whether the transaction was finalized and accepts no further operations.
    pub fn is_terminal(&self) -> bool { self.session.is_none() }

    /// Stage a resource record.
    ///
    /// # Returns
    /// Returns an error if the transaction is terminal, a version record exceeds its 16 bit length field,
    /// or the data exceeds the 32 bit resource size field.
    pub fn stage(
        &mut self, resource_type: u16, id: u16, language: u16, data: Vec<u8>,
    ) -> Result<(), TransactionError> {
        self.stage_record(ResourceRecord::new(resource_type, id, language, data))
    }

    /// Stage a resource record, replacing a staged record with the same type, id and language.
    pub fn stage_record(&mut self, record: ResourceRecord) -> Result<(), TransactionError> {
        if self.is_terminal() {
            return Err(TransactionError::InvalidState);
        }
        if record.resource_type == RT_VERSION && record.data.len() > u16::MAX as usize {
            return Err(TransactionError::Stage(format!(
                "version record of {} bytes exceeds the 16 bit length field",
                record.data.len()
            )));
        }
        if record.data.len() > u32::MAX as usize {
            return Err(TransactionError::Stage(format!(
                "resource of {} bytes exceeds the 32 bit size field",
                record.data.len()
            )));
        }
        debug!("staging resource {:?} ({} bytes)", record.key(), record.data.len());
        if let Some(previous) = self.staged.insert(record.key(), record) {
            debug!("replaced staged resource {:?}", previous.key());
        }
        Ok(())
    }

    /// Stage an opaque asset blob as `RT_RCDATA` resource.
    pub fn stage_asset(&mut self, data: Vec<u8>) -> Result<(), TransactionError> {
        self.stage(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US, data)
    }

    /// Read the file at the path and stage it as asset blob.
    pub fn stage_asset_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let data = fs::read(path)?;
        self.stage_asset(data)
    }

    /// Stage the images of an icon container and their icon group.
    ///
    /// # Returns
    /// Returns an error if the icon container is invalid, in which case nothing is staged.
    pub fn stage_icon(&mut self, icon: &[u8]) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let directory = IconDirectory::parse(icon)?;
        let (group, images) = directory.to_group_record();
        for image in images {
            self.stage(RT_ICON, image.id, LANGUAGE_ID_EN_US, image.data)?;
        }
        self.stage(RT_GROUP_ICON, ICON_GROUP_RESOURCE_ID, LANGUAGE_ID_EN_US, group.build())
    }

    /// Read the icon container at the path and stage its images and icon group.
    pub fn stage_icon_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let icon = fs::read(path)?;
        self.stage_icon(&icon)
    }

    /// Build and stage the version record.
    ///
    /// # Returns
    /// Returns an error if a block of the version record exceeds its 16 bit length field.
    pub fn stage_version_info(&mut self, version_info: &VersionInfo) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let record = version_info.build()?;
        self.stage(RT_VERSION, VERSION_RESOURCE_ID, LANGUAGE_ID_EN_US, record.into_data())
    }

    /// Commit all staged records to the executable as one unit.
    ///
    /// The transaction is terminal afterwards, whether the commit succeeded or not.
    /// If the commit fails, the staged records are discarded and the executable is left unchanged.
    pub fn finalize(&mut self) -> Result<Outcome, TransactionError> {
        let mut session = self.session.take().ok_or(TransactionError::InvalidState)?;
        let staged = std::mem::take(&mut self.staged);

        if staged.is_empty() {
            session.end(false).map_err(TransactionError::Commit)?;
            info!("no resources staged for {}, leaving it unchanged", self.path.display());
            return Ok(Outcome::NothingStaged);
        }

        for record in staged.values() {
            if let Err(error) = session.update(record) {
                warn!("failed to update resource {:?}: {}", record.key(), error);
                if let Err(error) = session.end(false) {
                    warn!("failed to discard update session: {}", error);
                }
                return Err(TransactionError::Commit(error));
            }
        }
        session.end(true).map_err(TransactionError::Commit)?;

        info!("committed {} resources to {}", staged.len(), self.path.display());
        Ok(Outcome::Committed {
            records: staged.len(),
        })
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.is_terminal() {
            return Err(TransactionError::InvalidState);
        }
        Ok(())
    }
}

impl<S: UpdateSession> Drop for ResourceTransaction<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(
                "resource transaction on {} dropped before finalizing, discarding {} staged resources",
                self.path.display(),
                self.staged.len()
            );
            if let Err(error) = session.end(false) {
                warn!("failed to discard update session: {}", error);
            }
        }
    }
}
