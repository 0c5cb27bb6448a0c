// SPDX-License-Identifier: Apache-2.0

//! The boundary to the hardware enclave builder

use crate::page::is_page_aligned;

use sgx::page::SecInfo;

/// The enclave an image is being loaded into
///
/// `addr + size` never overflows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Enclave {
    addr: u64,
    size: u64,
}

impl Enclave {
    /// Creates an enclave handle, checking that the base is page aligned.
    pub fn new(addr: u64, size: u64) -> crate::Result<Self> {
        if !is_page_aligned(addr) {
            return Err(crate::Error::InvalidParameter("unaligned enclave base"));
        }

        if addr.checked_add(size).is_none() {
            return Err(crate::Error::InvalidParameter("enclave range overflows"));
        }

        Ok(Self { addr, size })
    }

    /// The absolute base address of the enclave
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The size of the enclave in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// An in-progress hardware enclave build.
///
/// Pages are handed over one at a time in strictly increasing address order.
/// An implementation that rejects a page aborts the enumeration; undoing the
/// pages it already accepted is its own business.
pub trait LoadContext {
    /// Commits one page of `page.len() == PAGE_SIZE` bytes at `addr`.
    fn load_page(
        &mut self,
        enclave: &Enclave,
        addr: u64,
        page: &[u8],
        si: SecInfo,
    ) -> anyhow::Result<()>;
}
