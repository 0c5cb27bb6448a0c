// SPDX-License-Identifier: Apache-2.0

//! Rebasing of staged images
//!
//! Enclave images are position independent, and the absolute enclave base is
//! not known when the image is measured. The loader therefore rebases every
//! image to its enclave-relative position: each `R_X86_64_RELATIVE` target is
//! rewritten to `addend + delta`, where `delta` moves the image from its link
//! base to its `image_rva`. The records themselves are rewritten the same way
//! so that the enclave runtime can finish the job by adding the enclave base.

use super::binary::ElfImage;
use crate::{Error, Result};

use goblin::container::{Container, Ctx, Endian};
use goblin::elf::reloc::{RelocSection, R_X86_64_NONE, R_X86_64_RELATIVE};

/// The size of an `Elf64_Rela` record
pub const RELA_SIZE: usize = 24;

const OFFSET: usize = 0;
const ADDEND: usize = 16;

/// One validated relocation, ready to be written
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fixup {
    record: usize,
    target: usize,
    offset: u64,
    value: u64,
}

/// Validates every record and computes its fixup without touching the image.
pub fn fixups(image: &ElfImage) -> Result<Vec<Fixup>> {
    let relocs = image.relocs();
    if relocs.len() % RELA_SIZE != 0 {
        return Err(Error::format(format!(
            "relocation section size {:#x} is not a multiple of {}",
            relocs.len(),
            RELA_SIZE
        )));
    }

    if relocs.is_empty() {
        return Ok(Vec::new());
    }

    let delta = image.image_rva().wrapping_sub(image.link_base());
    let ctx = Ctx::new(Container::Big, Endian::Little);
    let section = RelocSection::parse(relocs, 0, relocs.len(), true, ctx)?;

    let mut fixups = Vec::with_capacity(relocs.len() / RELA_SIZE);
    for (record, reloc) in section.iter().enumerate() {
        match reloc.r_type {
            R_X86_64_NONE => continue,
            R_X86_64_RELATIVE if reloc.r_sym == 0 => (),
            R_X86_64_RELATIVE => {
                return Err(Error::format(format!(
                    "relative relocation at {:#x} references a symbol",
                    reloc.r_offset
                )))
            }
            kind => {
                return Err(Error::format(format!(
                    "unsupported relocation type {} at {:#x}",
                    kind, reloc.r_offset
                )))
            }
        }

        let target = reloc
            .r_offset
            .checked_sub(image.link_base())
            .filter(|t| t.saturating_add(8) <= image.image_size())
            .ok_or_else(|| {
                Error::format(format!(
                    "relocation at {:#x} lies outside the image",
                    reloc.r_offset
                ))
            })?;

        let addend = reloc.r_addend.unwrap_or(0) as u64;
        fixups.push(Fixup {
            record,
            target: target as usize,
            offset: reloc.r_offset.wrapping_add(delta),
            value: addend.wrapping_add(delta),
        });
    }

    Ok(fixups)
}

/// Rebases `image` to its `image_rva` using the fixups computed for it.
pub fn apply(image: &mut ElfImage, fixups: &[Fixup]) {
    for fixup in fixups {
        let word = &mut image.image_mut()[fixup.target..fixup.target + 8];
        word.copy_from_slice(&fixup.value.to_le_bytes());

        let record = &mut image.relocs_mut()[fixup.record * RELA_SIZE..][..RELA_SIZE];
        record[OFFSET..OFFSET + 8].copy_from_slice(&fixup.offset.to_le_bytes());
        record[ADDEND..ADDEND + 8].copy_from_slice(&fixup.value.to_le_bytes());
    }

    log::debug!(
        "{}: applied {} relocations for image at {:#x}",
        image.path().display(),
        fixups.len(),
        image.image_rva()
    );
}
