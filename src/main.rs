// SPDX-License-Identifier: Apache-2.0

//! This crate provides the `enclave-image` executable, which inspects enclave
//! binaries the way the SGX loader sees them.
//!
//! # Inspect an Image
//!
//!     $ target/debug/enclave-image info ./enclave.so
//!      ✔ ELF64 x86_64 position independent: ./enclave.so
//!      ✔ Entry point: 0x1000
//!      ...
//!
//! # Show the Enclave Layout
//!
//!     $ target/debug/enclave-image layout ./enclave.so --submodule ./libc.so
//!
//! # List the Pages a Loader Would Add
//!
//!     $ target/debug/enclave-image pages ./enclave.so --base 0x7f0000000000 --patch
//!
//! # Edit the Embedded Properties
//!
//!     $ target/debug/enclave-image properties ./enclave.so --heap-pages 1024 --write
//!
//! Logging is controlled through the `ENCLAVE_IMAGE_LOG` environment
//! variable, which takes `env_logger` filters:
//!
//!     $ ENCLAVE_IMAGE_LOG=debug target/debug/enclave-image layout ./enclave.so

#![deny(clippy::all)]
#![deny(missing_docs)]

use enclave_image::{Enclave, EnclaveImage, Image, LoadContext, SecInfo, PAGE_SIZE};

use anyhow::{anyhow, Result};
use structopt::StructOpt;

use std::path::{Path, PathBuf};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
}

/// Prints what the loader thinks of an image
#[derive(StructOpt)]
struct Info {
    /// The enclave image
    image: PathBuf,
}

/// Prints the enclave layout of an image
#[derive(StructOpt)]
struct Layout {
    /// A dependent image placed after the main one
    #[structopt(long)]
    submodule: Option<PathBuf>,

    /// Bytes reserved for caller data
    #[structopt(long, default_value = "0")]
    extra: u64,

    /// The enclave image
    image: PathBuf,
}

/// Lists every page the loader would add to an enclave
#[derive(StructOpt)]
struct Pages {
    /// A dependent image placed after the main one
    #[structopt(long)]
    submodule: Option<PathBuf>,

    /// Enclave base address (hex)
    #[structopt(long, default_value = "0", parse(try_from_str = parse_hex))]
    base: u64,

    /// Enclave size (hex); derived from the image when absent
    #[structopt(long, parse(try_from_str = parse_hex))]
    size: Option<u64>,

    /// Patch the image before listing its pages
    #[structopt(long)]
    patch: bool,

    /// The enclave image
    image: PathBuf,
}

/// Prints or edits the embedded enclave properties
#[derive(StructOpt)]
struct Properties {
    /// Set the number of heap pages
    #[structopt(long)]
    heap_pages: Option<u64>,

    /// Set the number of stack pages
    #[structopt(long)]
    stack_pages: Option<u64>,

    /// Set the number of thread control structures
    #[structopt(long)]
    tcs: Option<u64>,

    /// Write the edited properties back to the image file
    #[structopt(long)]
    write: bool,

    /// The enclave image
    image: PathBuf,
}

#[derive(StructOpt)]
#[structopt(version=VERSION, author=AUTHORS.split(';').next().unwrap_or_default())]
enum Options {
    Info(Info),
    Layout(Layout),
    Pages(Pages),
    Properties(Properties),
}

fn main() -> Result<()> {
    let env = env_logger::Env::new().filter_or("ENCLAVE_IMAGE_LOG", "warn");
    env_logger::Builder::from_env(env).init();

    match Options::from_args() {
        Options::Info(opts) => info(opts),
        Options::Layout(opts) => layout(opts),
        Options::Pages(opts) => pages(opts),
        Options::Properties(opts) => properties(opts),
    }
}

fn load(image: &Path, submodule: Option<&Path>) -> Result<EnclaveImage> {
    let image = match submodule {
        Some(sub) => EnclaveImage::load_with_submodule(image, sub)?,
        None => EnclaveImage::load(image)?,
    };

    Ok(image)
}

fn info(opts: Info) -> Result<()> {
    use colorful::*;

    let image = match EnclaveImage::load(&opts.image) {
        Ok(image) => image,
        Err(e) => {
            println!(" {} {}: {}", "✗".red(), opts.image.display(), e);
            return Err(e.into());
        }
    };

    println!("Format: {:?}", image.image_type());
    let data = image.data();

    for datum in &data {
        let icon = match datum.pass {
            true => "✔".green(),
            false => "✗".red(),
        };

        if let Some(info) = datum.info.as_ref() {
            println!(" {} {}: {}", icon, datum.name, info);
        } else {
            println!(" {} {}", icon, datum.name);
        }
    }

    for datum in &data {
        if let Some(mesg) = datum.mesg.as_ref() {
            println!("\n{}\n", mesg);
        }
    }

    Ok(())
}

fn layout(opts: Layout) -> Result<()> {
    let image = load(&opts.image, opts.submodule.as_deref())?;

    let names = ["primary", "submodule"];
    for (name, module) in names.iter().zip(image.modules()?) {
        println!("{} {} at {:#x}", name, module.path.display(), module.image_rva);
        for seg in &module.segments {
            println!(
                "  segment {:#010x} memsz {:#x} {:?}",
                seg.rva, seg.size, seg.flags
            );
        }

        if module.tls_size > 0 {
            println!("  tls {:#x} bytes", module.tls_size);
        }
        println!("  relocations {:#x} bytes", module.reloc_size);
    }

    let layout = image.layout(opts.extra)?;
    println!("image size  {:#x}", image.calculate_size()?);
    println!("tls pages   {}", image.get_tls_page_count()?);
    println!(
        "tls         {:#x}..{:#x}",
        layout.tls.start, layout.submodule_tls.end
    );
    println!(
        "relocations {:#x}..{:#x}",
        layout.reloc.start, layout.reloc.end
    );
    println!(
        "extra data  {:#x}..{:#x}",
        layout.extra.start, layout.extra.end
    );
    println!("heap        {:#x}", layout.heap_rva);

    Ok(())
}

/// Prints every page instead of building an enclave
struct Printer {
    count: usize,
}

impl LoadContext for Printer {
    fn load_page(
        &mut self,
        _enclave: &Enclave,
        addr: u64,
        page: &[u8],
        si: SecInfo,
    ) -> anyhow::Result<()> {
        let used = page.iter().rposition(|b| *b != 0).map_or(0, |n| n + 1);
        println!("{:#014x} {:?} ({} bytes used)", addr, si, used);
        self.count += 1;
        Ok(())
    }
}

/// The smallest power of two holding the images and the requested heap
fn default_size(image: &EnclaveImage) -> Result<u64> {
    let layout = image.layout(0)?;
    let heap = image
        .sgx_load_enclave_properties()
        .map(|p| p.header.size_settings.num_heap_pages)
        .unwrap_or(0);

    heap.checked_mul(PAGE_SIZE)
        .and_then(|heap| heap.checked_add(layout.heap_rva))
        .and_then(u64::checked_next_power_of_two)
        .ok_or_else(|| anyhow!("enclave size overflows"))
}

fn pages(opts: Pages) -> Result<()> {
    let mut image = load(&opts.image, opts.submodule.as_deref())?;

    let size = match opts.size {
        Some(size) => size,
        None => default_size(&image)?,
    };

    if opts.patch {
        image.sgx_patch(size, 0)?;
    }

    let enclave = Enclave::new(opts.base, size)?;
    let mut printer = Printer { count: 0 };
    let mut vaddr = 0;
    image.add_pages(&mut printer, &enclave, &mut vaddr)?;

    println!(
        "{} pages, next free address {:#x}",
        printer.count,
        enclave.addr() + vaddr
    );

    for module in image.sgx_get_debug_modules(&enclave)? {
        println!(
            "module {} at {:#x} ({:#x} bytes)",
            module.path.display(),
            module.base_address,
            module.size
        );
    }

    image.unload()?;
    Ok(())
}

fn properties(opts: Properties) -> Result<()> {
    let mut image = EnclaveImage::load(&opts.image)?;
    let mut props = image.sgx_load_enclave_properties()?;

    let edit = opts.heap_pages.is_some() || opts.stack_pages.is_some() || opts.tcs.is_some();
    let sizes = &mut props.header.size_settings;
    if let Some(n) = opts.heap_pages {
        sizes.num_heap_pages = n;
    }
    if let Some(n) = opts.stack_pages {
        sizes.num_stack_pages = n;
    }
    if let Some(n) = opts.tcs {
        sizes.num_tcs = n;
    }

    if edit {
        image.sgx_update_enclave_properties(&props)?;
    }

    println!("size           {:#x}", props.header.size);
    println!("heap pages     {}", props.header.size_settings.num_heap_pages);
    println!("stack pages    {}", props.header.size_settings.num_stack_pages);
    println!("tcs            {}", props.header.size_settings.num_tcs);
    println!("product id     {}", props.config.product_id);
    println!("svn            {}", props.config.security_version);
    println!("attributes     {:#x}", props.config.attributes);
    println!("xfrm           {:#x}", props.config.xfrm);
    println!("heap rva       {:#x}", props.image_info.heap_rva);
    println!("enclave size   {:#x}", props.image_info.enclave_size);

    if opts.write {
        image.flush_enclave_properties()?;
    }

    image.unload()?;
    Ok(())
}
