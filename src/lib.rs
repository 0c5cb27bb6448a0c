// SPDX-License-Identifier: Apache-2.0

//! This crate stages enclave binaries for loading into an Intel SGX enclave.
//!
//! An [`EnclaveImage`] is opened from a position independent ELF64 file and
//! optionally joined by one dependent submodule. From there the loader:
//!
//!   1. sizes the enclave ([`Image::calculate_size`],
//!      [`Image::get_tls_page_count`]),
//!   2. rebases the images and fills in the embedded enclave properties
//!      ([`Image::sgx_patch`]),
//!   3. hands every page, with its permissions, to a [`LoadContext`] in
//!      ascending address order ([`Image::add_pages`]).
//!
//! ```no_run
//! use enclave_image::{Enclave, EnclaveImage, Image, LoadContext, SecInfo};
//!
//! struct Builder;
//!
//! impl LoadContext for Builder {
//!     fn load_page(&mut self, _: &Enclave, addr: u64, _: &[u8], si: SecInfo) -> anyhow::Result<()> {
//!         println!("{:#x} {:?}", addr, si);
//!         Ok(())
//!     }
//! }
//!
//! let mut image = EnclaveImage::load("enclave.so")?;
//! let size = image.calculate_size()? * 4;
//! image.sgx_patch(size, 0)?;
//!
//! let enclave = Enclave::new(0x7f00_0000_0000, size)?;
//! image.add_pages(&mut Builder, &enclave, &mut 0)?;
//! image.unload()?;
//! # Ok::<(), enclave_image::Error>(())
//! ```

#![deny(clippy::all)]
#![deny(missing_docs)]

mod context;
mod error;
mod page;

pub mod image;
pub mod properties;

pub use context::{Enclave, LoadContext};
pub use error::{Error, Result, Status};
pub use image::elf::{ElfEnclave, ElfImage};
pub use image::{
    Datum, DebugModule, EnclaveImage, Image, ImageType, Layout, ModuleLayout, SegmentLayout,
};
pub use page::PAGE_SIZE;
pub use sgx::page::{Flags, SecInfo};
pub use properties::{EnclaveProperties, PropertiesLocation};
