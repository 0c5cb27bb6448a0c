// SPDX-License-Identifier: Apache-2.0

//! Builds small ELF64 images in memory for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use enclave_image::{EnclaveProperties, PAGE_SIZE};

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_RELATIVE: u32 = 8;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

/// Segment contents start one page into the file, leaving room for headers.
const DATA_OFFSET: u64 = PAGE_SIZE;

pub struct Load {
    pub vaddr: u64,
    pub memsz: u64,
    pub flags: u32,
    pub data: Vec<u8>,
}

struct Section {
    name: &'static str,
    kind: u32,
    addr: u64,
    offset: u64,
    size: u64,
    align: u64,
    entsize: u64,
}

pub struct ElfBuilder {
    pub base: u64,
    pub entry: u64,
    pub e_type: u16,
    pub machine: u16,
    pub interp: bool,
    pub loads: Vec<Load>,
    pub tdata: Option<(u64, u64, u64)>,
    pub tbss: Option<(u64, u64)>,
    pub oeinfo: Option<u64>,
    pub oeinfo_offset: Option<u64>,
    pub relocs: Vec<(u64, u32, i64)>,
    pub rela_kind: u32,
}

impl ElfBuilder {
    /// An empty position independent x86_64 image linked at `base`
    pub fn new(base: u64) -> Self {
        Self {
            base,
            entry: base,
            e_type: ET_DYN,
            machine: EM_X86_64,
            interp: false,
            loads: Vec::new(),
            tdata: None,
            tbss: None,
            oeinfo: None,
            oeinfo_offset: None,
            relocs: Vec::new(),
            rela_kind: SHT_RELA,
        }
    }

    /// Adds a loadable segment at `base + rva` whose file contents are `data`.
    pub fn load(mut self, rva: u64, memsz: u64, flags: u32, data: Vec<u8>) -> Self {
        self.loads.push(Load {
            vaddr: self.base + rva,
            memsz,
            flags,
            data,
        });
        self
    }

    /// Writes `bytes` into the segment covering `base + rva`.
    pub fn poke(mut self, rva: u64, bytes: &[u8]) -> Self {
        let vaddr = self.base + rva;
        let load = self
            .loads
            .iter_mut()
            .find(|l| vaddr >= l.vaddr && vaddr + bytes.len() as u64 <= l.vaddr + l.data.len() as u64)
            .expect("no segment holds the bytes");

        let at = (vaddr - load.vaddr) as usize;
        load.data[at..at + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Embeds `props` as the `.oeinfo` section at `base + rva`.
    pub fn properties(mut self, rva: u64, props: &EnclaveProperties) -> Self {
        self = self.poke(rva, props.as_bytes());
        self.oeinfo = Some(self.base + rva);
        self
    }

    pub fn tdata(mut self, rva: u64, size: u64, align: u64) -> Self {
        self.tdata = Some((self.base + rva, size, align));
        self
    }

    pub fn tbss(mut self, size: u64, align: u64) -> Self {
        self.tbss = Some((size, align));
        self
    }

    /// Adds a relocation record with a link-time target of `base + rva`.
    pub fn reloc(mut self, rva: u64, kind: u32, addend: i64) -> Self {
        self.relocs.push((self.base + rva, kind, addend));
        self
    }

    /// Where the segment holding `base + rva` starts in the file
    pub fn file_offset(&self, rva: u64) -> u64 {
        DATA_OFFSET + rva
    }

    pub fn build(&self) -> Vec<u8> {
        let end = self
            .loads
            .iter()
            .map(|l| self.file_offset(l.vaddr - self.base) + l.data.len() as u64)
            .max()
            .unwrap_or(DATA_OFFSET);

        let mut file = vec![0u8; end as usize];
        for load in &self.loads {
            let at = self.file_offset(load.vaddr - self.base) as usize;
            file[at..at + load.data.len()].copy_from_slice(&load.data);
        }

        let mut sections = Vec::new();

        if let Some((addr, size, align)) = self.tdata {
            sections.push(Section {
                name: ".tdata",
                kind: SHT_PROGBITS,
                addr,
                offset: self.file_offset(addr - self.base),
                size,
                align,
                entsize: 0,
            });
        }

        if let Some((size, align)) = self.tbss {
            sections.push(Section {
                name: ".tbss",
                kind: SHT_NOBITS,
                addr: 0,
                offset: 0,
                size,
                align,
                entsize: 0,
            });
        }

        if let Some(addr) = self.oeinfo {
            sections.push(Section {
                name: ".oeinfo",
                kind: SHT_PROGBITS,
                addr,
                offset: self
                    .oeinfo_offset
                    .unwrap_or_else(|| self.file_offset(addr - self.base)),
                size: EnclaveProperties::SIZE as u64,
                align: 16,
                entsize: 0,
            });
        }

        if !self.relocs.is_empty() {
            let offset = file.len() as u64;
            for (target, kind, addend) in &self.relocs {
                file.extend_from_slice(&target.to_le_bytes());
                file.extend_from_slice(&u64::from(*kind).to_le_bytes());
                file.extend_from_slice(&addend.to_le_bytes());
            }

            sections.push(Section {
                name: ".rela.dyn",
                kind: self.rela_kind,
                addr: 0,
                offset,
                size: file.len() as u64 - offset,
                align: 8,
                entsize: 24,
            });
        }

        // .shstrtab
        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for section in &sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(section.name.as_bytes());
            names.push(0);
        }
        let shstrtab_name = names.len() as u32;
        names.extend_from_slice(b".shstrtab\0");

        let shstrtab_offset = file.len() as u64;
        file.extend_from_slice(&names);
        while file.len() % 8 != 0 {
            file.push(0);
        }

        let shoff = file.len() as u64;
        file.extend_from_slice(&[0u8; SHDR_SIZE]);
        for (section, name) in sections.iter().zip(&name_offsets) {
            shdr(&mut file, *name, section);
        }
        shdr(
            &mut file,
            shstrtab_name,
            &Section {
                name: ".shstrtab",
                kind: SHT_STRTAB,
                addr: 0,
                offset: shstrtab_offset,
                size: names.len() as u64,
                align: 1,
                entsize: 0,
            },
        );

        let shnum = sections.len() as u16 + 2;
        let phnum = self.loads.len() as u16 + self.interp as u16;

        let mut head = Vec::with_capacity(EHDR_SIZE);
        head.extend_from_slice(b"\x7fELF");
        head.extend_from_slice(&[2, 1, 1, 0]);
        head.extend_from_slice(&[0u8; 8]);
        head.extend_from_slice(&self.e_type.to_le_bytes());
        head.extend_from_slice(&self.machine.to_le_bytes());
        head.extend_from_slice(&1u32.to_le_bytes());
        head.extend_from_slice(&self.entry.to_le_bytes());
        head.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        head.extend_from_slice(&shoff.to_le_bytes());
        head.extend_from_slice(&0u32.to_le_bytes());
        head.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        head.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        head.extend_from_slice(&phnum.to_le_bytes());
        head.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        head.extend_from_slice(&shnum.to_le_bytes());
        head.extend_from_slice(&(shnum - 1).to_le_bytes());

        let interp_offset = EHDR_SIZE + PHDR_SIZE * usize::from(phnum);
        if self.interp {
            phdr(
                &mut head,
                PT_INTERP,
                PF_R,
                interp_offset as u64,
                0,
                INTERP.len() as u64,
                INTERP.len() as u64,
            );
        }

        for load in &self.loads {
            phdr(
                &mut head,
                PT_LOAD,
                load.flags,
                self.file_offset(load.vaddr - self.base),
                load.vaddr,
                load.data.len() as u64,
                load.memsz,
            );
        }

        if self.interp {
            head.extend_from_slice(INTERP);
        }

        assert!(head.len() as u64 <= DATA_OFFSET);
        file[..head.len()].copy_from_slice(&head);
        file
    }

    /// Builds the image and writes it to `dir/name`.
    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, self.build()).unwrap();
        path
    }
}

fn phdr(out: &mut Vec<u8>, kind: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&PAGE_SIZE.to_le_bytes());
}

fn shdr(out: &mut Vec<u8>, name: u32, section: &Section) {
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&section.kind.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&section.addr.to_le_bytes());
    out.extend_from_slice(&section.offset.to_le_bytes());
    out.extend_from_slice(&section.size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&section.align.to_le_bytes());
    out.extend_from_slice(&section.entsize.to_le_bytes());
}

/// A typical enclave: code, read-only data, and writable data carrying the
/// properties, linked at `base`.
pub fn enclave(base: u64) -> ElfBuilder {
    let mut code = vec![0x90u8; 0x200];
    code[0] = 0xc3;

    let mut props = EnclaveProperties::default();
    props.header.size_settings.num_heap_pages = 16;
    props.header.size_settings.num_stack_pages = 4;
    props.header.size_settings.num_tcs = 2;

    ElfBuilder::new(base)
        .load(0, 0x200, PF_R | PF_X, code)
        .load(PAGE_SIZE, 0x100, PF_R, vec![0x11; 0x100])
        .load(2 * PAGE_SIZE, PAGE_SIZE + 0x800, PF_R | PF_W, vec![0; PAGE_SIZE as usize])
        .properties(2 * PAGE_SIZE + 0x100, &props)
}
