// SPDX-License-Identifier: Apache-2.0

//! ELF enclave images
//!
//! An [`ElfEnclave`] owns the primary [`ElfImage`] and at most one dependent
//! submodule image, placed in the enclave right after the primary.

mod binary;
mod layout;
mod pages;
mod reloc;

pub use binary::{ElfImage, Segment, Tls};

use super::{Datum, DebugModule, Image, Layout, ModuleLayout};
use crate::context::{Enclave, LoadContext};
use crate::page::{is_page_aligned, page_raise, PAGE_SIZE};
use crate::properties::{self, EnclaveProperties};
use crate::{Error, Result};

use std::fs::File;
use std::mem::size_of;
use std::path::Path;

/// The ELF flavour of an enclave image
#[derive(Debug)]
pub struct ElfEnclave {
    primary: ElfImage,
    submodule: Option<Box<ElfImage>>,
    patched: bool,
}

impl ElfEnclave {
    pub(crate) fn load(path: &Path, file: File, bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            primary: ElfImage::parse(path, file, bytes)?,
            submodule: None,
            patched: false,
        })
    }

    /// The primary image
    #[inline]
    pub fn primary(&self) -> &ElfImage {
        &self.primary
    }

    /// The submodule image, if one is attached
    #[inline]
    pub fn submodule(&self) -> Option<&ElfImage> {
        self.submodule.as_deref()
    }

    /// Whether `sgx_patch` has been applied
    #[inline]
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    fn check_loaded(&self) -> Result<()> {
        match self.primary.is_loaded() {
            true => Ok(()),
            false => Err(Error::InvalidParameter("image has been unloaded")),
        }
    }

    fn properties_bytes(&self) -> Result<(&[u8], std::ops::Range<usize>)> {
        self.check_loaded()?;

        let location = self.primary.properties().ok_or(Error::NotFound)?;
        let range = location.range(self.primary.image_size())?;
        Ok((self.primary.image(), range))
    }
}

impl Image for ElfEnclave {
    fn calculate_size(&self) -> Result<u64> {
        self.check_loaded()?;
        layout::calculate_size(&self.primary, self.submodule())
    }

    fn get_tls_page_count(&self) -> Result<u64> {
        self.check_loaded()?;

        let mut count = layout::tls_page_count(&self.primary)?;
        if let Some(sub) = self.submodule() {
            count += layout::tls_page_count(sub)?;
        }

        Ok(count)
    }

    fn add_pages(
        &self,
        context: &mut dyn LoadContext,
        enclave: &Enclave,
        vaddr: &mut u64,
    ) -> Result<()> {
        self.check_loaded()?;
        pages::add_pages(&self.primary, self.submodule(), context, enclave, vaddr)
    }

    fn sgx_patch(&mut self, enclave_size: u64, extra_data_size: u64) -> Result<()> {
        self.check_loaded()?;

        if self.patched {
            return Err(Error::AlreadyPatched);
        }

        if enclave_size == 0 || !is_page_aligned(enclave_size) {
            return Err(Error::InvalidParameter("enclave size is not page aligned"));
        }

        let layout = self.layout(extra_data_size)?;

        // Compute the patched properties before anything is modified.
        let update = match self.sgx_load_enclave_properties() {
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
            Ok(mut props) => {
                let heap = props
                    .header
                    .size_settings
                    .num_heap_pages
                    .checked_mul(PAGE_SIZE)
                    .and_then(|heap| heap.checked_add(layout.heap_rva))
                    .ok_or(Error::InvalidParameter("heap size overflows"))?;

                if enclave_size < heap {
                    return Err(Error::InvalidParameter(
                        "enclave size cannot hold the image and heap",
                    ));
                }

                let location = self.primary.properties().ok_or(Error::NotFound)?;
                let reloc_size = self.primary.relocs().len()
                    + self.submodule().map(|s| s.relocs().len()).unwrap_or(0);

                props.image_info.oeinfo_rva = self.primary.image_rva() + location.rva();
                props.image_info.oeinfo_size = size_of::<EnclaveProperties>() as u64;
                props.image_info.reloc_rva = layout.reloc.start;
                props.image_info.reloc_size = reloc_size as u64;
                props.image_info.heap_rva = layout.heap_rva;
                props.image_info.enclave_size = enclave_size;
                Some(props)
            }
        };

        if update.is_none() && enclave_size < layout.heap_rva {
            return Err(Error::InvalidParameter("enclave size cannot hold the image"));
        }

        // Every record of both images is checked before either is touched.
        let primary = reloc::fixups(&self.primary)?;
        let submodule = match self.submodule() {
            Some(sub) => reloc::fixups(sub)?,
            None => Vec::new(),
        };

        reloc::apply(&mut self.primary, &primary);
        if let Some(sub) = self.submodule.as_deref_mut() {
            reloc::apply(sub, &submodule);
        }

        if let Some(props) = update {
            self.sgx_update_enclave_properties(&props)?;
        }

        self.patched = true;
        log::info!(
            "{}: patched for enclave size {:#x}, heap at {:#x}",
            self.primary.path().display(),
            enclave_size,
            layout.heap_rva
        );

        Ok(())
    }

    fn sgx_get_debug_modules(&self, enclave: &Enclave) -> Result<Vec<DebugModule>> {
        self.check_loaded()?;

        let images = std::iter::once(&self.primary).chain(self.submodule());
        images
            .map(|image| -> Result<DebugModule> {
                let base_address = enclave
                    .addr()
                    .checked_add(image.image_rva())
                    .ok_or(Error::InvalidParameter("module lies beyond the address space"))?;

                Ok(DebugModule {
                    path: image.path().to_owned(),
                    base_address,
                    size: image.image_size(),
                })
            })
            .collect()
    }

    fn sgx_load_enclave_properties(&self) -> Result<EnclaveProperties> {
        let (image, range) = self.properties_bytes()?;
        EnclaveProperties::from_bytes(&image[range])
    }

    fn sgx_update_enclave_properties(&mut self, properties: &EnclaveProperties) -> Result<()> {
        let (_, range) = self.properties_bytes()?;

        if properties.header.size as usize != EnclaveProperties::SIZE {
            return Err(Error::InvalidParameter("properties header size is wrong"));
        }

        self.primary.image_mut()[range].copy_from_slice(properties.as_bytes());
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        // Release the submodule even if the primary is already gone.
        if let Some(mut sub) = self.submodule.take() {
            sub.unload();
        }

        self.primary.unload();
        Ok(())
    }

    fn attach_submodule(&mut self, path: &Path) -> Result<()> {
        self.check_loaded()?;

        if self.submodule.is_some() {
            return Err(Error::InvalidParameter("a submodule is already attached"));
        }

        if self.patched {
            return Err(Error::InvalidParameter("image is already patched"));
        }

        let mut sub = ElfImage::open(path)?;
        sub.set_image_rva(page_raise(
            self.primary.image_rva() + self.primary.image_size(),
        )?);

        log::debug!(
            "{}: attached submodule {} at {:#x}",
            self.primary.path().display(),
            path.display(),
            sub.image_rva()
        );

        self.submodule = Some(Box::new(sub));
        Ok(())
    }

    fn flush_enclave_properties(&self) -> Result<()> {
        let props = self.sgx_load_enclave_properties()?;
        let location = self.primary.properties().ok_or(Error::NotFound)?;
        properties::flush(self.primary.path(), &location, &props)
    }

    fn layout(&self, extra_data_size: u64) -> Result<Layout> {
        self.check_loaded()?;
        layout::calculate(&self.primary, self.submodule(), extra_data_size)
    }

    fn modules(&self) -> Result<Vec<ModuleLayout>> {
        self.check_loaded()?;

        std::iter::once(&self.primary)
            .chain(self.submodule())
            .map(layout::module)
            .collect()
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        self.primary.is_loaded()
    }

    fn data(&self) -> Vec<Datum> {
        let mut data = vec![Datum {
            name: "ELF64 x86_64 position independent".into(),
            pass: self.is_loaded(),
            info: Some(self.primary.path().display().to_string()),
            mesg: None,
        }];

        if !self.is_loaded() {
            return data;
        }

        data.push(Datum {
            name: "Entry point".into(),
            pass: true,
            info: Some(format!("{:#x}", self.primary.entry_rva())),
            mesg: None,
        });

        let props = self.sgx_load_enclave_properties();
        data.push(Datum {
            name: "Enclave properties".into(),
            pass: props.is_ok(),
            info: self
                .primary
                .properties()
                .map(|loc| format!("{} at file offset {:#x}", properties::SECTION, loc.file_offset())),
            mesg: props.err().map(|e| {
                format!(
                    "{}\n\nThe enclave must embed its properties in the {} section.",
                    e,
                    properties::SECTION
                )
            }),
        });

        let images = std::iter::once(&self.primary).chain(self.submodule());
        let relocs: usize = images.map(|i| i.relocs().len()).sum();
        data.push(Datum {
            name: "Relocations".into(),
            pass: true,
            info: Some(format!("{}", relocs / reloc::RELA_SIZE)),
            mesg: None,
        });

        let tls = self.get_tls_page_count();
        data.push(Datum {
            name: "TLS pages".into(),
            pass: tls.is_ok(),
            info: tls.ok().map(|n| n.to_string()),
            mesg: None,
        });

        if let Some(sub) = self.submodule() {
            data.push(Datum {
                name: "Submodule".into(),
                pass: true,
                info: Some(format!("{} at {:#x}", sub.path().display(), sub.image_rva())),
                mesg: None,
            });
        }

        data
    }
}
