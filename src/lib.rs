//! **Res**ource **patch**ing for portable executables.
//!
//! Supports:
//! * Replacing the application icon from an icon container
//! * Building and embedding version information
//! * Embedding opaque asset blobs
//! * Committing a batch of resource replacements to an executable as one unit
//!
//! See [`ResourceTransaction`] for the main entry point for patching an executable,
//! and [`Image`] for parsing and rebuilding executable images directly.
//!
//! # Examples
//!
//! ### Resource transaction
//! ```
//! use respatch::{Outcome, ResourceTransaction, VersionInfo};
//!
//! // lock the executable and begin a transaction
//! let mut transaction = ResourceTransaction::open(BINARY_PATH)?;
//!
//! // stage the icon images and the icon group
//! transaction.stage_icon_file(ICON_PATH)?;
//!
//! // stage the version record
//! let mut version_info = VersionInfo {
//!     company_name: "Example".into(),
//!     product_name: "Example App".into(),
//!     ..Default::default()
//! };
//! version_info.set_file_version("1.2.3");
//! version_info.set_product_version("1.2.3");
//! transaction.stage_version_info(&version_info)?;
//!
//! // write all staged resources at once
//! assert_eq!(transaction.finalize()?, Outcome::Committed { records: 3 });
//! ```
//!
//! ### Direct resource editing
//! ```
//! use respatch::{constants::*, Image};
//!
//! let data = std::fs::read(BINARY_PATH)?;
//!
//! // parse the executable image
//! let mut image = Image::parse(&data)?;
//!
//! // get the resource directory
//! let mut resources = image.resource_directory().cloned().unwrap_or_default();
//!
//! // set the asset blob in the resource directory
//! resources.set(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US, asset);
//!
//! // set the resource directory in the image
//! image.set_resource_directory(resources)?;
//!
//! // build an executable image with all changes applied
//! let target = image.data();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

extern crate alloc;

pub(crate) mod errors;
pub(crate) mod icon;
pub(crate) mod image;
pub(crate) mod resource;
pub(crate) mod util;
pub(crate) mod version;

#[cfg(feature = "std")]
pub(crate) mod session;
#[cfg(feature = "std")]
pub(crate) mod transaction;

pub mod constants;
pub mod types;

pub use crate::{errors::*, icon::*, image::*, resource::*, version::*};
#[cfg(feature = "std")]
pub use crate::{session::*, transaction::*};
