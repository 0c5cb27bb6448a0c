// SPDX-License-Identifier: Apache-2.0

//! The enclave properties record embedded in an enclave image
//!
//! An enclave image carries one fixed-layout [`EnclaveProperties`] record in
//! the `.oeinfo` section. The signing tool rewrites it in the file without
//! relinking, so its location is tracked both as an image-relative address
//! and as a byte offset into the file (see [`PropertiesLocation`]).
//!
//! The loader only interprets `header.size` and the `image_info` block; all
//! other fields are carried through untouched.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::Path;

use crate::{Error, Result};

/// The name of the section holding the enclave properties
pub const SECTION: &str = ".oeinfo";

/// The size of the SGX signature structure stored with the properties
pub const SIGSTRUCT_SIZE: usize = 1808;

/// Enclave sizing requested by the enclave author
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeSettings {
    /// Number of heap pages
    pub num_heap_pages: u64,

    /// Number of stack pages per thread
    pub num_stack_pages: u64,

    /// Number of thread control structures
    pub num_tcs: u64,
}

/// Properties header
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Size of the whole properties record
    pub size: u32,

    /// Enclave type
    pub enclave_type: u32,

    /// Enclave sizing
    pub size_settings: SizeSettings,
}

/// SGX identity and attribute configuration
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// ISV product id
    pub product_id: u16,

    /// ISV security version
    pub security_version: u16,

    /// Configuration flags
    pub flags: u32,

    /// ISV family id
    pub family_id: [u8; 16],

    /// ISV extended product id
    pub extended_product_id: [u8; 16],

    /// SGX attributes
    pub attributes: u64,

    /// Extended feature request mask
    pub xfrm: u64,
}

/// Layout facts computed by the loader when the image is patched
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Enclave-relative address of the properties record
    pub oeinfo_rva: u64,

    /// Size of the properties record
    pub oeinfo_size: u64,

    /// Enclave-relative address of the relocation pages
    pub reloc_rva: u64,

    /// Size of the relocation records in bytes
    pub reloc_size: u64,

    /// Enclave-relative address of the heap
    pub heap_rva: u64,

    /// Total enclave size
    pub enclave_size: u64,
}

/// The enclave configuration record
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EnclaveProperties {
    /// Header
    pub header: Header,

    /// SGX configuration
    pub config: Config,

    /// Loader computed layout
    pub image_info: ImageInfo,

    /// The enclave signature
    pub sigstruct: [u8; SIGSTRUCT_SIZE],
}

impl Default for EnclaveProperties {
    fn default() -> Self {
        Self {
            header: Header {
                size: size_of::<Self>() as u32,
                ..Default::default()
            },
            config: Config::default(),
            image_info: ImageInfo::default(),
            sigstruct: [0; SIGSTRUCT_SIZE],
        }
    }
}

impl EnclaveProperties {
    /// The encoded size of the record
    pub const SIZE: usize = size_of::<Self>();

    /// Decodes a record from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Properties(format!(
                "section holds {} bytes, need {}",
                bytes.len(),
                Self::SIZE
            )));
        }

        // Every field is plain integer data, so any bit pattern is valid.
        let props = unsafe { bytes.as_ptr().cast::<Self>().read_unaligned() };

        if props.header.size as usize != Self::SIZE {
            return Err(Error::Properties(format!(
                "header declares {} bytes, expected {}",
                props.header.size,
                Self::SIZE
            )));
        }

        Ok(props)
    }

    /// The encoded bytes of the record.
    pub fn as_bytes(&self) -> &[u8] {
        // repr(C) with naturally aligned fields and no padding
        unsafe { std::slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) }
    }
}

/// Where the properties record lives, in memory and on disk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PropertiesLocation {
    rva: u64,
    file_offset: u64,
    size: u64,
}

impl PropertiesLocation {
    pub(crate) fn new(rva: u64, file_offset: u64, size: u64) -> Self {
        Self {
            rva,
            file_offset,
            size,
        }
    }

    /// Address of the section relative to the image's link base
    #[inline]
    pub fn rva(&self) -> u64 {
        self.rva
    }

    /// Byte offset of the section in the image file
    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Size of the section in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Checks that the section can hold a record within an image of
    /// `image_size` bytes, returning the staging range it occupies.
    pub(crate) fn range(&self, image_size: u64) -> Result<std::ops::Range<usize>> {
        if self.size < EnclaveProperties::SIZE as u64 {
            return Err(Error::Properties(format!(
                "{} section is {} bytes, need {}",
                SECTION,
                self.size,
                EnclaveProperties::SIZE
            )));
        }

        let end = self.rva.saturating_add(EnclaveProperties::SIZE as u64);
        if end > image_size {
            return Err(Error::Properties(format!(
                "{} section lies outside the loaded image",
                SECTION
            )));
        }

        Ok(self.rva as usize..end as usize)
    }
}

/// Writes `props` into the image file at its recorded byte offset.
pub(crate) fn flush(
    path: &Path,
    location: &PropertiesLocation,
    props: &EnclaveProperties,
) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(location.file_offset))?;
    file.write_all(props.as_bytes())?;
    file.sync_all()?;

    log::info!(
        "wrote enclave properties to {} at offset {:#x}",
        path.display(),
        location.file_offset
    );

    Ok(())
}
