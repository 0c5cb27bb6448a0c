// SPDX-License-Identifier: Apache-2.0

use crate::page::{is_page_aligned, lower, page_raise, PAGE_SIZE};
use crate::properties::{PropertiesLocation, SECTION};
use crate::{Error, Result};

use std::convert::TryFrom;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use goblin::elf::header::{EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_DYN};
use goblin::elf::program_header::{PT_INTERP, PT_LOAD};
use goblin::elf::section_header::SHT_RELA;
use goblin::elf::{Elf, Header, ProgramHeader};
use itertools::Itertools;
use lset::Line;

/// The largest image the loader will stage (the SGX enclave size limit)
const MAX_IMAGE_SIZE: u64 = 64 << 30;

/// One loadable region of an image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Size of this segment in memory
    pub memsz: u64,

    /// Offset of this segment within the file
    pub offset: u64,

    /// Address of this segment relative to the image's link base
    pub vaddr: u64,

    /// ELF protection flags (`PF_*`)
    pub flags: u32,
}

impl Segment {
    /// The image-relative pages this segment occupies.
    ///
    /// A zero-sized segment occupies no page at all.
    pub fn pages(&self) -> Line<u64> {
        let start = lower(self.vaddr, PAGE_SIZE);
        let end = match self.memsz {
            0 => start,
            n => lower(self.vaddr + n + PAGE_SIZE - 1, PAGE_SIZE),
        };

        Line { start, end }
    }
}

/// Thread-local storage template geometry
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tls {
    /// Image-relative address of `.tdata`
    pub tdata_rva: u64,

    /// Size of `.tdata`
    pub tdata_size: u64,

    /// Alignment of `.tdata`
    pub tdata_align: u64,

    /// Size of `.tbss`
    pub tbss_size: u64,

    /// Alignment of `.tbss`
    pub tbss_align: u64,
}

impl Tls {
    /// Whether the image has any thread-local storage
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tdata_size == 0 && self.tbss_size == 0
    }
}

/// A parsed ELF image staged for loading into an enclave
#[derive(Debug)]
pub struct ElfImage {
    file: Option<File>,
    path: PathBuf,
    header: Header,

    /// The lowest loadable page at link time
    link_base: u64,

    image: Vec<u8>,
    image_rva: u64,
    image_size: u64,

    segments: Vec<Segment>,
    relocs: Vec<u8>,
    tls: Tls,
    entry_rva: u64,
    properties: Option<PropertiesLocation>,
}

fn check_align(name: &str, align: u64) -> Result<u64> {
    if align > 1 && !align.is_power_of_two() {
        return Err(Error::format(format!(
            "{} alignment {:#x} is not a power of two",
            name, align
        )));
    }

    Ok(align)
}

fn file_bytes<'a>(bytes: &'a [u8], offset: u64, size: u64, what: &str) -> Result<&'a [u8]> {
    let range = usize::try_from(offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(usize::try_from(size).ok()?)?))
        .filter(|range| range.end <= bytes.len())
        .ok_or_else(|| Error::format(format!("{} lies outside the file", what)))?;

    Ok(&bytes[range])
}

/// Finds the link-time address of the properties section.
///
/// The section must lie in the file contents of one loadable segment, at the
/// same offset from the segment start in memory as in the file.
fn properties_addr(loads: &[&ProgramHeader], addr: u64, offset: u64, size: u64) -> Result<u64> {
    let end = addr
        .checked_add(size)
        .ok_or_else(|| Error::format(format!("{} address overflow", SECTION)))?;

    let ph = loads
        .iter()
        .find(|ph| addr >= ph.p_vaddr && end <= ph.p_vaddr.saturating_add(ph.p_filesz))
        .ok_or_else(|| {
            Error::format(format!("{} is not in the file contents of a segment", SECTION))
        })?;

    if offset.checked_sub(ph.p_offset) != Some(addr - ph.p_vaddr) {
        return Err(Error::format(format!(
            "{} file offset {:#x} does not match its address {:#x}",
            SECTION, offset, addr
        )));
    }

    Ok(addr)
}

impl ElfImage {
    /// Opens and parses the image at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::parse(path, file, &bytes)
    }

    /// Parses `bytes`, the contents of `file` at `path`.
    ///
    /// On success the image keeps `file` open until it is unloaded.
    pub(crate) fn parse(path: &Path, file: File, bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes)?;
        Self::validate(&elf)?;

        let mut loads: Vec<&ProgramHeader> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .collect();
        loads.sort_by_key(|ph| ph.p_vaddr);

        for ph in &loads {
            if ph.p_memsz < ph.p_filesz {
                return Err(Error::format(format!(
                    "segment at {:#x} has memsz < filesz",
                    ph.p_vaddr
                )));
            }

            if ph.p_memsz == 0 {
                log::debug!("{}: skipping empty segment at {:#x}", path.display(), ph.p_vaddr);
            }
        }

        // Empty segments occupy no page, so they neither move the link base
        // nor extend the image.
        loads.retain(|ph| ph.p_memsz > 0);
        if loads.is_empty() {
            return Err(Error::format("no loadable segments"));
        }

        let mut hi = 0u64;
        for ph in &loads {
            let end = ph
                .p_vaddr
                .checked_add(ph.p_memsz)
                .ok_or_else(|| Error::format("segment address overflow"))?;
            hi = hi.max(end);
        }

        let link_base = lower(loads[0].p_vaddr, PAGE_SIZE);
        let image_size = page_raise(hi)? - link_base;
        if image_size > MAX_IMAGE_SIZE {
            return Err(Error::format(format!(
                "image spans {:#x} bytes, more than an enclave can hold",
                image_size
            )));
        }

        let segments: Vec<Segment> = loads
            .iter()
            .map(|ph| Segment {
                memsz: ph.p_memsz,
                offset: ph.p_offset,
                vaddr: ph.p_vaddr - link_base,
                flags: ph.p_flags,
            })
            .collect();

        for (a, b) in segments.iter().tuple_windows() {
            if b.pages().start < a.pages().end {
                return Err(Error::format(format!(
                    "segments at {:#x} and {:#x} share a page",
                    a.vaddr + link_base,
                    b.vaddr + link_base
                )));
            }
        }

        // Stage the loadable bytes at their relative offsets; gaps and
        // zero-fill tails stay zero.
        let mut image = vec![0u8; image_size as usize];
        for (ph, seg) in loads.iter().zip(&segments) {
            let src = file_bytes(bytes, ph.p_offset, ph.p_filesz, "segment")?;
            let dst = seg.vaddr as usize;
            image[dst..dst + src.len()].copy_from_slice(src);
        }

        let entry = elf.header.e_entry;
        if !loads
            .iter()
            .any(|ph| entry >= ph.p_vaddr && entry < ph.p_vaddr + ph.p_memsz)
        {
            return Err(Error::format(format!(
                "entry point {:#x} is outside every loadable segment",
                entry
            )));
        }

        let mut tls = Tls::default();
        let mut relocs = Vec::new();
        let mut properties = None;

        for sh in &elf.section_headers {
            let name = match elf.shdr_strtab.get_at(sh.sh_name) {
                Some(name) => name,
                None => continue,
            };

            match name {
                ".tdata" => {
                    tls.tdata_rva = sh
                        .sh_addr
                        .checked_sub(link_base)
                        .filter(|rva| rva.saturating_add(sh.sh_size) <= image_size)
                        .ok_or_else(|| Error::format(".tdata lies outside the image"))?;
                    tls.tdata_size = sh.sh_size;
                    tls.tdata_align = check_align(".tdata", sh.sh_addralign)?;
                }

                ".tbss" => {
                    tls.tbss_size = sh.sh_size;
                    tls.tbss_align = check_align(".tbss", sh.sh_addralign)?;
                }

                ".rela.dyn" => {
                    if sh.sh_type != SHT_RELA {
                        return Err(Error::format(".rela.dyn is not a RELA section"));
                    }

                    relocs = file_bytes(bytes, sh.sh_offset, sh.sh_size, ".rela.dyn")?.to_vec();
                    if relocs.is_empty() {
                        log::warn!("{}: empty .rela.dyn section", path.display());
                    }
                }

                ".rela.plt" if sh.sh_size > 0 => {
                    return Err(Error::format("PLT relocations are not supported"));
                }

                SECTION => {
                    let addr = properties_addr(&loads, sh.sh_addr, sh.sh_offset, sh.sh_size)?;
                    properties = Some(PropertiesLocation::new(
                        addr - link_base,
                        sh.sh_offset,
                        sh.sh_size,
                    ));
                }

                _ => (),
            }
        }

        debug_assert!(is_page_aligned(image_size));
        log::debug!(
            "{}: {} segments, {:#x} bytes at link base {:#x}, {:#x} relocation bytes, tls {:?}",
            path.display(),
            segments.len(),
            image_size,
            link_base,
            relocs.len(),
            tls
        );

        if properties.is_none() {
            log::debug!("{}: no {} section", path.display(), SECTION);
        }

        Ok(Self {
            file: Some(file),
            path: path.to_owned(),
            header: elf.header,
            link_base,
            image,
            image_rva: 0,
            image_size,
            segments,
            relocs,
            tls,
            entry_rva: entry - link_base,
            properties,
        })
    }

    fn validate(elf: &Elf<'_>) -> Result<()> {
        let header = &elf.header;

        if header.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(Error::format("not a 64-bit image"));
        }

        if header.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(Error::format("not a little-endian image"));
        }

        if header.e_machine != EM_X86_64 {
            return Err(Error::format(format!(
                "unsupported machine {:#x}",
                header.e_machine
            )));
        }

        if header.e_type != ET_DYN {
            return Err(Error::format("image is not position independent"));
        }

        if elf.program_headers.iter().any(|ph| ph.p_type == PT_INTERP) {
            return Err(Error::format("image requests an interpreter"));
        }

        Ok(())
    }

    /// Releases the staging buffer and closes the file.
    ///
    /// Returns whether anything was released.
    pub fn unload(&mut self) -> bool {
        match self.file.take() {
            Some(_) => {
                self.image = Vec::new();
                self.relocs = Vec::new();
                log::info!("unloaded {}", self.path.display());
                true
            }
            None => false,
        }
    }

    /// Whether the image still holds its file and staging buffer
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.file.is_some()
    }

    /// Path the image was loaded from
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The ELF file header
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The lowest loadable page at link time
    #[inline]
    pub fn link_base(&self) -> u64 {
        self.link_base
    }

    /// The staged image contents
    #[inline]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    #[inline]
    pub(crate) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    /// Where the image sits relative to the enclave base
    #[inline]
    pub fn image_rva(&self) -> u64 {
        self.image_rva
    }

    pub(crate) fn set_image_rva(&mut self, rva: u64) {
        debug_assert!(is_page_aligned(rva));
        self.image_rva = rva;
    }

    /// Page-aligned size of the staged image
    #[inline]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Loadable segments in ascending address order
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The raw `.rela.dyn` records
    #[inline]
    pub fn relocs(&self) -> &[u8] {
        &self.relocs
    }

    #[inline]
    pub(crate) fn relocs_mut(&mut self) -> &mut [u8] {
        &mut self.relocs
    }

    /// Thread-local storage geometry
    #[inline]
    pub fn tls(&self) -> &Tls {
        &self.tls
    }

    /// Entry point relative to the link base
    #[inline]
    pub fn entry_rva(&self) -> u64 {
        self.entry_rva
    }

    /// Where the enclave properties are, if the section exists
    #[inline]
    pub fn properties(&self) -> Option<PropertiesLocation> {
        self.properties
    }
}

#[cfg(test)]
use goblin::container::Ctx;

#[cfg(test)]
impl ElfImage {
    /// Builds an image directly from staged parts.
    pub(crate) fn synthetic(
        link_base: u64,
        image: Vec<u8>,
        segments: Vec<Segment>,
        relocs: Vec<u8>,
        tls: Tls,
        properties: Option<PropertiesLocation>,
    ) -> Self {
        let image_size = image.len() as u64;
        assert!(is_page_aligned(image_size));

        Self {
            file: Some(tempfile()),
            path: PathBuf::from("synthetic.so"),
            header: Header::new(Ctx::default()),
            link_base,
            image,
            image_rva: 0,
            image_size,
            segments,
            relocs,
            tls,
            entry_rva: 0,
            properties,
        }
    }
}

#[cfg(test)]
fn tempfile() -> File {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "enclave-image-synthetic-{}-{}",
        std::process::id(),
        n
    ));
    let file = File::create(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    file
}
