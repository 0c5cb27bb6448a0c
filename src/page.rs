// SPDX-License-Identifier: Apache-2.0

//! Enclave page geometry and SGX page permissions

use goblin::elf::program_header::{PF_R, PF_W, PF_X};
use primordial::Page;
use sgx::page::Flags;

/// The size of an enclave page in bytes
pub const PAGE_SIZE: u64 = Page::SIZE as u64;

#[inline]
pub(crate) const fn lower(value: u64, boundary: u64) -> u64 {
    value / boundary * boundary
}

#[inline]
pub(crate) fn raise(value: u64, boundary: u64) -> Option<u64> {
    value
        .checked_add(boundary - 1)
        .map(|v| lower(v, boundary))
}

/// Rounds `value` up to a whole number of pages, failing on overflow.
#[inline]
pub(crate) fn page_raise(value: u64) -> crate::Result<u64> {
    raise(value, PAGE_SIZE).ok_or_else(|| crate::Error::format("address overflow"))
}

/// The number of pages needed to hold `bytes` bytes.
#[inline]
pub(crate) fn page_count(bytes: u64) -> crate::Result<u64> {
    Ok(page_raise(bytes)? / PAGE_SIZE)
}

#[inline]
pub(crate) fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE == 0
}

/// Translates ELF program header flags into SGX page permissions.
pub(crate) fn permissions(p_flags: u32) -> Flags {
    let mut rwx = Flags::empty();
    if p_flags & PF_R != 0 {
        rwx |= Flags::READ;
    }
    if p_flags & PF_W != 0 {
        rwx |= Flags::WRITE;
    }
    if p_flags & PF_X != 0 {
        rwx |= Flags::EXECUTE;
    }

    rwx
}
