// SPDX-License-Identifier: Apache-2.0

//! # Enclave images
//!
//! An [`EnclaveImage`] is a loaded enclave binary in one of the supported
//! formats (currently only ELF). Every operation is reached through the
//! [`Image`] trait, which each format implements; [`EnclaveImage`] itself
//! only selects the implementation for its variant. Supporting a new format
//! means adding a variant and implementing [`Image`] for it.

pub mod elf;
pub mod layout;

pub use layout::{Layout, ModuleLayout, SegmentLayout};

use crate::context::{Enclave, LoadContext};
use crate::properties::EnclaveProperties;
use crate::{Error, Result};

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use goblin::Hint;

/// The format of an enclave image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageType {
    /// Not a supported format
    None,

    /// An ELF image
    Elf,
}

impl ImageType {
    /// Identifies the format of `bytes` from its magic number.
    pub fn probe(bytes: &[u8]) -> Self {
        let mut magic = [0u8; 16];
        if bytes.len() < magic.len() {
            return ImageType::None;
        }
        let n = magic.len();
        magic.copy_from_slice(&bytes[..n]);

        match goblin::peek_bytes(&magic) {
            Ok(Hint::Elf(_)) => ImageType::Elf,
            _ => ImageType::None,
        }
    }
}

/// An image module as seen by a debugger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugModule {
    /// Path of the module on the host
    pub path: PathBuf,

    /// Absolute address of the module in the enclave
    pub base_address: u64,

    /// Size of the module in the enclave
    pub size: u64,
}

/// A single piece of data about an enclave image
pub struct Datum {
    /// The name of this datum.
    pub name: String,

    /// Whether the datum indicates a usable image or not.
    pub pass: bool,

    /// Short additional information to display to the user.
    pub info: Option<String>,

    /// Longer explanatory message on how to resolve problems.
    pub mesg: Option<String>,
}

/// The operations every image format provides
pub trait Image {
    /// The page-aligned size of all loaded images
    fn calculate_size(&self) -> Result<u64>;

    /// The number of pages holding the thread-local storage templates
    fn get_tls_page_count(&self) -> Result<u64>;

    /// Submits every page to `context`, advancing `vaddr` past each one.
    ///
    /// `vaddr` is relative to `enclave.addr()` and must not be beyond the
    /// first page of the image.
    fn add_pages(
        &self,
        context: &mut dyn LoadContext,
        enclave: &Enclave,
        vaddr: &mut u64,
    ) -> Result<()>;

    /// Rebases the staged images and fills in the loader-computed
    /// properties. May only be applied once.
    fn sgx_patch(&mut self, enclave_size: u64, extra_data_size: u64) -> Result<()>;

    /// Describes the loaded modules for debugger registration.
    fn sgx_get_debug_modules(&self, enclave: &Enclave) -> Result<Vec<DebugModule>>;

    /// Reads the embedded enclave properties.
    fn sgx_load_enclave_properties(&self) -> Result<EnclaveProperties>;

    /// Replaces the embedded enclave properties in the staged image.
    fn sgx_update_enclave_properties(&mut self, properties: &EnclaveProperties) -> Result<()>;

    /// Releases every resource the image holds. Safe to repeat.
    fn unload(&mut self) -> Result<()>;

    /// Loads the one allowed dependent image.
    fn attach_submodule(&mut self, path: &Path) -> Result<()>;

    /// Writes the staged enclave properties back to the image file.
    fn flush_enclave_properties(&self) -> Result<()>;

    /// Where each region of the enclave goes, given `extra_data_size`
    /// bytes reserved by the caller
    fn layout(&self, extra_data_size: u64) -> Result<Layout>;

    /// The loaded modules, primary first, with their segments
    fn modules(&self) -> Result<Vec<ModuleLayout>>;

    /// Whether the image still holds its resources
    fn is_loaded(&self) -> bool;

    /// Facts about the image for display
    fn data(&self) -> Vec<Datum>;
}

/// A loaded enclave image
#[derive(Debug)]
pub enum EnclaveImage {
    /// An ELF image
    Elf(elf::ElfEnclave),
}

impl EnclaveImage {
    /// Loads the image at `path`, selecting the format from its contents.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        match ImageType::probe(&bytes) {
            ImageType::Elf => Ok(Self::Elf(elf::ElfEnclave::load(path, file, &bytes)?)),
            ImageType::None => {
                log::debug!("{}: unrecognized format", path.display());
                Err(Error::UnknownFormat)
            }
        }
    }

    /// Loads the image at `path` along with its submodule.
    ///
    /// If the submodule fails to load, the primary image is released again.
    pub fn load_with_submodule(path: impl AsRef<Path>, submodule: impl AsRef<Path>) -> Result<Self> {
        let mut image = Self::load(path)?;

        if let Err(e) = image.attach_submodule(submodule.as_ref()) {
            image.unload()?;
            return Err(e);
        }

        Ok(image)
    }

    /// The format of the image
    pub fn image_type(&self) -> ImageType {
        match self {
            Self::Elf(_) => ImageType::Elf,
        }
    }

    fn ops(&self) -> &dyn Image {
        match self {
            Self::Elf(elf) => elf,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn Image {
        match self {
            Self::Elf(elf) => elf,
        }
    }
}

impl Image for EnclaveImage {
    #[inline]
    fn calculate_size(&self) -> Result<u64> {
        self.ops().calculate_size()
    }

    #[inline]
    fn get_tls_page_count(&self) -> Result<u64> {
        self.ops().get_tls_page_count()
    }

    #[inline]
    fn add_pages(
        &self,
        context: &mut dyn LoadContext,
        enclave: &Enclave,
        vaddr: &mut u64,
    ) -> Result<()> {
        self.ops().add_pages(context, enclave, vaddr)
    }

    #[inline]
    fn sgx_patch(&mut self, enclave_size: u64, extra_data_size: u64) -> Result<()> {
        self.ops_mut().sgx_patch(enclave_size, extra_data_size)
    }

    #[inline]
    fn sgx_get_debug_modules(&self, enclave: &Enclave) -> Result<Vec<DebugModule>> {
        self.ops().sgx_get_debug_modules(enclave)
    }

    #[inline]
    fn sgx_load_enclave_properties(&self) -> Result<EnclaveProperties> {
        self.ops().sgx_load_enclave_properties()
    }

    #[inline]
    fn sgx_update_enclave_properties(&mut self, properties: &EnclaveProperties) -> Result<()> {
        self.ops_mut().sgx_update_enclave_properties(properties)
    }

    #[inline]
    fn unload(&mut self) -> Result<()> {
        self.ops_mut().unload()
    }

    #[inline]
    fn attach_submodule(&mut self, path: &Path) -> Result<()> {
        self.ops_mut().attach_submodule(path)
    }

    #[inline]
    fn flush_enclave_properties(&self) -> Result<()> {
        self.ops().flush_enclave_properties()
    }

    #[inline]
    fn layout(&self, extra_data_size: u64) -> Result<Layout> {
        self.ops().layout(extra_data_size)
    }

    #[inline]
    fn modules(&self) -> Result<Vec<ModuleLayout>> {
        self.ops().modules()
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        self.ops().is_loaded()
    }

    #[inline]
    fn data(&self) -> Vec<Datum> {
        self.ops().data()
    }
}
