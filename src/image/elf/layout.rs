// SPDX-License-Identifier: Apache-2.0

use super::binary::{ElfImage, Tls};
use crate::image::{Layout, ModuleLayout, SegmentLayout};
use crate::page::{page_count, page_raise, permissions, raise, PAGE_SIZE};
use crate::{Error, Result};

use lset::{Line, Span};

/// Bytes needed for one TLS template: `.tdata` followed by the aligned `.tbss`.
pub fn tls_size(tls: &Tls) -> Result<u64> {
    if tls.is_empty() {
        return Ok(0);
    }

    let tbss = raise(tls.tdata_size, tls.tbss_align.max(1))
        .ok_or_else(|| Error::format("TLS size overflow"))?;

    tbss.checked_add(tls.tbss_size)
        .ok_or_else(|| Error::format("TLS size overflow"))
}

/// Pages needed for the TLS template of one image.
#[inline]
pub fn tls_page_count(image: &ElfImage) -> Result<u64> {
    page_count(tls_size(image.tls())?)
}

/// The enclave-relative extent of an image
#[inline]
pub fn extent(image: &ElfImage) -> Line<u64> {
    Line::from(Span {
        start: image.image_rva(),
        count: image.image_size(),
    })
}

/// The page-aligned size of the primary image plus the optional submodule
/// laid out right after it.
pub fn calculate_size(primary: &ElfImage, submodule: Option<&ElfImage>) -> Result<u64> {
    let end = match submodule {
        Some(sub) => extent(sub).end,
        None => extent(primary).end,
    };

    page_raise(end)
}

fn after(prev: Line<u64>, bytes: u64) -> Result<Line<u64>> {
    let count = page_raise(bytes)?;
    prev.end
        .checked_add(count)
        .ok_or_else(|| Error::format("enclave layout overflow"))?;

    Ok(Line::from(Span {
        start: prev.end,
        count,
    }))
}

/// Computes the layout for the given images and extra data size.
pub fn calculate(
    primary: &ElfImage,
    submodule: Option<&ElfImage>,
    extra_data_size: u64,
) -> Result<Layout> {
    let image = Line {
        start: 0,
        end: calculate_size(primary, submodule)?,
    };

    let tls = after(image, tls_page_count(primary)? * PAGE_SIZE)?;
    let submodule_tls = match submodule {
        Some(sub) => after(tls, tls_page_count(sub)? * PAGE_SIZE)?,
        None => after(tls, 0)?,
    };

    let reloc_size = primary.relocs().len() as u64
        + submodule.map(|s| s.relocs().len() as u64).unwrap_or(0);
    let reloc = after(submodule_tls, reloc_size)?;
    let extra = after(reloc, extra_data_size)?;

    Ok(Layout {
        primary: extent(primary),
        submodule: submodule.map(extent),
        tls,
        submodule_tls,
        reloc,
        extra,
        heap_rva: extra.end,
    })
}

/// Describes where `image` and its segments sit in the enclave.
pub fn module(image: &ElfImage) -> Result<ModuleLayout> {
    let segments = image
        .segments()
        .iter()
        .map(|seg| SegmentLayout {
            rva: image.image_rva() + seg.vaddr,
            size: seg.memsz,
            flags: permissions(seg.flags),
        })
        .collect();

    Ok(ModuleLayout {
        path: image.path().to_owned(),
        image_rva: image.image_rva(),
        image_size: image.image_size(),
        segments,
        tls_size: tls_size(image.tls())?,
        reloc_size: image.relocs().len() as u64,
    })
}
