// SPDX-License-Identifier: Apache-2.0

//! Enclave-relative placement of the loaded images
//!
//! ```text
//! 0          primary image
//!            submodule image (optional)
//!            TLS templates (primary, then submodule)
//!            relocation records
//!            caller's extra data
//! heap_rva   heap and everything the runtime lays out after it
//! ```

use sgx::page::Flags;

use std::path::PathBuf;

use lset::Line;

/// Where each part of the enclave image goes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// The primary image
    pub primary: Line<u64>,

    /// The submodule image
    pub submodule: Option<Line<u64>>,

    /// TLS template pages of the primary image
    pub tls: Line<u64>,

    /// TLS template pages of the submodule
    pub submodule_tls: Line<u64>,

    /// Relocation record pages
    pub reloc: Line<u64>,

    /// Caller reserved extra data
    pub extra: Line<u64>,

    /// Start of the heap
    pub heap_rva: u64,
}

impl Layout {
    /// The end of the last page `add_pages` commits
    #[inline]
    pub fn pages_end(&self) -> u64 {
        self.reloc.end
    }
}

/// A loadable segment as placed in the enclave
#[derive(Copy, Clone, Debug)]
pub struct SegmentLayout {
    /// Enclave-relative address of the segment
    pub rva: u64,

    /// Size of the segment in memory
    pub size: u64,

    /// Page permissions of the segment
    pub flags: Flags,
}

/// One loaded module as placed in the enclave
#[derive(Clone, Debug)]
pub struct ModuleLayout {
    /// Path of the module on the host
    pub path: PathBuf,

    /// Enclave-relative address of the module
    pub image_rva: u64,

    /// Page-aligned size of the module
    pub image_size: u64,

    /// Loadable segments, in ascending address order
    pub segments: Vec<SegmentLayout>,

    /// Bytes of thread-local storage template
    pub tls_size: u64,

    /// Bytes of relocation records
    pub reloc_size: u64,
}
