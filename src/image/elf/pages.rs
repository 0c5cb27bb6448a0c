// SPDX-License-Identifier: Apache-2.0

use super::binary::ElfImage;
use super::layout::{self, tls_size};
use crate::context::{Enclave, LoadContext};
use crate::page::{permissions, PAGE_SIZE};
use crate::{Error, Result};

use std::borrow::Cow;

use lset::Line;
use sgx::page::{Class, Flags, SecInfo};

/// A run of enclave pages with identical permissions
struct Segment<'a> {
    flags: Flags,
    dst: u64,
    src: Cow<'a, [u8]>,
}

fn image_segments(image: &ElfImage) -> impl Iterator<Item = Segment<'_>> {
    image.segments().iter().map(move |seg| {
        let Line { start, end } = seg.pages();

        Segment {
            flags: permissions(seg.flags),
            dst: image.image_rva() + start,
            src: Cow::Borrowed(&image.image()[start as usize..end as usize]),
        }
    })
}

/// The `.tdata` initializer followed by the zeroed `.tbss`, padded to pages.
fn tls_template(image: &ElfImage, pages: Line<u64>) -> Result<Segment<'_>> {
    let tls = image.tls();
    let mut src = vec![0u8; (pages.end - pages.start) as usize];
    debug_assert!(tls_size(tls)? <= src.len() as u64);

    let tdata = tls.tdata_rva as usize..(tls.tdata_rva + tls.tdata_size) as usize;
    src[..tdata.len()].copy_from_slice(&image.image()[tdata]);

    Ok(Segment {
        flags: Flags::READ | Flags::WRITE,
        dst: pages.start,
        src: Cow::Owned(src),
    })
}

fn reloc_segment<'a>(
    primary: &'a ElfImage,
    submodule: Option<&'a ElfImage>,
    pages: Line<u64>,
) -> Segment<'a> {
    let src = match submodule.filter(|s| !s.relocs().is_empty()) {
        None => Cow::Borrowed(primary.relocs()),
        Some(sub) => {
            let mut both = primary.relocs().to_vec();
            both.extend_from_slice(sub.relocs());
            Cow::Owned(both)
        }
    };

    Segment {
        flags: Flags::READ,
        dst: pages.start,
        src,
    }
}

/// Submits every page of the images to `context`, in ascending order.
pub fn add_pages(
    primary: &ElfImage,
    submodule: Option<&ElfImage>,
    context: &mut dyn LoadContext,
    enclave: &Enclave,
    vaddr: &mut u64,
) -> Result<()> {
    let layout = layout::calculate(primary, submodule, 0)?;

    if *vaddr > layout.primary.start {
        return Err(Error::InvalidParameter(
            "cursor is past the start of the image",
        ));
    }

    if layout.pages_end() > enclave.size() {
        return Err(Error::InvalidParameter("enclave is too small for the image"));
    }

    let mut segments: Vec<Segment<'_>> = image_segments(primary).collect();
    if let Some(sub) = submodule {
        segments.extend(image_segments(sub));
    }

    if !primary.tls().is_empty() {
        segments.push(tls_template(primary, layout.tls)?);
    }
    if let Some(sub) = submodule.filter(|s| !s.tls().is_empty()) {
        segments.push(tls_template(sub, layout.submodule_tls)?);
    }

    if layout.reloc.end > layout.reloc.start {
        segments.push(reloc_segment(primary, submodule, layout.reloc));
    }

    let mut count = 0usize;
    for seg in &segments {
        for (i, chunk) in seg.src.chunks(PAGE_SIZE as usize).enumerate() {
            let rva = seg.dst + i as u64 * PAGE_SIZE;
            if rva < *vaddr {
                return Err(Error::format(format!("page {:#x} is out of order", rva)));
            }

            let page: Cow<'_, [u8]> = match chunk.len() {
                n if n == PAGE_SIZE as usize => Cow::Borrowed(chunk),
                _ => {
                    let mut page = chunk.to_vec();
                    page.resize(PAGE_SIZE as usize, 0);
                    Cow::Owned(page)
                }
            };

            let addr = enclave.addr() + rva;
            log::trace!("page {:#x} {:?}", addr, seg.flags);
            context.load_page(enclave, addr, &page, SecInfo::new(Class::Regular, seg.flags))?;

            *vaddr = rva + PAGE_SIZE;
            count += 1;
        }
    }

    log::debug!(
        "{}: added {} pages, cursor at {:#x}",
        primary.path().display(),
        count,
        *vaddr
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::binary::{Segment as ElfSegment, Tls};
    use super::*;
    use goblin::elf::program_header::{PF_R, PF_W, PF_X};

    #[derive(Default)]
    struct Recorder {
        pages: Vec<(u64, Vec<u8>, SecInfo)>,
        reject_after: Option<usize>,
    }

    impl LoadContext for Recorder {
        fn load_page(
            &mut self,
            _enclave: &Enclave,
            addr: u64,
            page: &[u8],
            si: SecInfo,
        ) -> anyhow::Result<()> {
            assert_eq!(page.len(), PAGE_SIZE as usize);
            if self.reject_after == Some(self.pages.len()) {
                anyhow::bail!("out of EPC");
            }
            self.pages.push((addr, page.to_vec(), si));
            Ok(())
        }
    }

    fn two_segment_image() -> ElfImage {
        let mut image = vec![0u8; 3 * PAGE_SIZE as usize];
        image[0] = 0xc3;
        image[2 * PAGE_SIZE as usize] = 0x42;

        let segments = vec![
            ElfSegment {
                memsz: 0x10,
                offset: 0,
                vaddr: 0,
                flags: PF_R | PF_X,
            },
            ElfSegment {
                memsz: 0x1800,
                offset: 0x2000,
                vaddr: 0x1800,
                flags: PF_R | PF_W,
            },
        ];

        ElfImage::synthetic(0, image, segments, vec![], Tls::default(), None)
    }

    #[test]
    fn pages_follow_segments() {
        let image = two_segment_image();
        let enclave = Enclave::new(0x100000, 0x10000).unwrap();
        let mut ctx = Recorder::default();
        let mut vaddr = 0;

        add_pages(&image, None, &mut ctx, &enclave, &mut vaddr).unwrap();

        let addrs: Vec<u64> = ctx.pages.iter().map(|p| p.0).collect();
        assert_eq!(addrs, vec![0x100000, 0x101000, 0x102000]);
        assert_eq!(ctx.pages[0].2, SecInfo::new(Class::Regular, Flags::READ | Flags::EXECUTE));
        assert_eq!(ctx.pages[1].2, SecInfo::new(Class::Regular, Flags::READ | Flags::WRITE));
        assert_eq!(ctx.pages[0].1[0], 0xc3);
        assert_eq!(ctx.pages[2].1[0], 0x42);
        assert_eq!(vaddr, 3 * PAGE_SIZE);
    }

    #[test]
    fn rejection_stops_the_walk() {
        let image = two_segment_image();
        let enclave = Enclave::new(0, 0x10000).unwrap();
        let mut ctx = Recorder {
            reject_after: Some(1),
            ..Default::default()
        };
        let mut vaddr = 0;

        let err = add_pages(&image, None, &mut ctx, &enclave, &mut vaddr).unwrap_err();
        assert!(matches!(err, Error::Context(_)));
        assert_eq!(ctx.pages.len(), 1);
        assert_eq!(vaddr, PAGE_SIZE);
    }

    #[test]
    fn small_enclave() {
        let image = two_segment_image();
        let enclave = Enclave::new(0, 2 * PAGE_SIZE).unwrap();
        let mut ctx = Recorder::default();
        let mut vaddr = 0;

        let err = add_pages(&image, None, &mut ctx, &enclave, &mut vaddr).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        assert!(ctx.pages.is_empty());
    }

    #[test]
    fn cursor_past_image() {
        let image = two_segment_image();
        let enclave = Enclave::new(0, 0x10000).unwrap();
        let mut ctx = Recorder::default();
        let mut vaddr = PAGE_SIZE;

        assert!(add_pages(&image, None, &mut ctx, &enclave, &mut vaddr).is_err());
        assert!(ctx.pages.is_empty());
    }

    #[test]
    fn tls_template_after_segments() {
        let mut image = vec![0u8; PAGE_SIZE as usize];
        image[0x800..0x804].copy_from_slice(&[1, 2, 3, 4]);

        let tls = Tls {
            tdata_rva: 0x800,
            tdata_size: 4,
            tdata_align: 4,
            tbss_size: 0x10,
            tbss_align: 8,
        };
        let segment = ElfSegment {
            memsz: PAGE_SIZE,
            offset: 0,
            vaddr: 0,
            flags: PF_R | PF_W,
        };
        let image = ElfImage::synthetic(0, image, vec![segment], vec![], tls, None);

        let enclave = Enclave::new(0, 0x10000).unwrap();
        let mut ctx = Recorder::default();
        let mut vaddr = 0;
        add_pages(&image, None, &mut ctx, &enclave, &mut vaddr).unwrap();

        assert_eq!(ctx.pages.len(), 2);
        let (addr, page, si) = &ctx.pages[1];
        assert_eq!(*addr, PAGE_SIZE);
        assert_eq!(&page[..4], &[1, 2, 3, 4]);
        assert!(page[4..].iter().all(|b| *b == 0));
        assert_eq!(*si, SecInfo::new(Class::Regular, Flags::READ | Flags::WRITE));
    }
}
