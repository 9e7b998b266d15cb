//! Copyin/Copyout - User↔Kernel data transfer
//!
//! User addresses are resolved through the process's region 1 page table,
//! never dereferenced directly. Every entry point validates first:
//!
//! 1. The pointer is non-null and the length non-negative
//! 2. The whole span lies inside the user region
//! 3. Every page the span touches is valid and carries the requested bits
//!
//! Strings and string vectors have no length up front, so they are walked
//! one byte (or one pointer slot) at a time, validating as they go.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{is_user_range, PAGE_SHIFT, PAGE_SIZE, VMEM_1_BASE, VMEM_1_LIMIT, WORD_SIZE};
use crate::mach_vm::{PageTable, VmProt};

// ============================================================================
// Error Types
// ============================================================================

/// Copy operation result
pub type CopyResult<T = ()> = Result<T, CopyError>;

/// Errors that can occur during copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CopyError {
    /// Null pointer or span outside the user region
    BadAddress = -1,
    /// A spanned page has no valid mapping
    PageFault = -2,
    /// A spanned page lacks the requested protection
    Protection = -3,
    /// Negative length
    BadLength = -4,
    /// String or vector runs off the end of the user region
    Unterminated = -5,
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CopyError::BadAddress => "bad user address",
            CopyError::PageFault => "user page not mapped",
            CopyError::Protection => "user page protection",
            CopyError::BadLength => "negative length",
            CopyError::Unterminated => "unterminated user data",
        };
        f.write_str(msg)
    }
}

// ============================================================================
// Address Validation
// ============================================================================

fn check_page(table: &PageTable, va: usize, need: VmProt) -> CopyResult {
    let pte = table
        .get((va - VMEM_1_BASE) >> PAGE_SHIFT)
        .ok_or(CopyError::BadAddress)?;
    if !pte.valid {
        return Err(CopyError::PageFault);
    }
    if !pte.prot.contains(need) {
        return Err(CopyError::Protection);
    }
    Ok(())
}

/// Validate `len` bytes at `va` for access `need`
///
/// `len` is the raw operand; a negative value (as the process sees it) is
/// rejected. A zero-length span still requires the first page.
pub fn validate(table: &PageTable, va: usize, len: isize, need: VmProt) -> CopyResult {
    if va == 0 {
        return Err(CopyError::BadAddress);
    }
    if len < 0 {
        return Err(CopyError::BadLength);
    }
    let span = (len as usize).max(1);
    if !is_user_range(va, span) {
        return Err(CopyError::BadAddress);
    }
    let mut page = va & !(PAGE_SIZE - 1);
    let last = va + span - 1;
    while page <= last {
        check_page(table, page, need)?;
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Validate a NUL-terminated string, returning its length without the NUL
pub fn validate_str(memory: &[u8], table: &PageTable, va: usize) -> CopyResult<usize> {
    if va == 0 {
        return Err(CopyError::BadAddress);
    }
    let mut addr = va;
    let mut checked_page = None;
    loop {
        if addr < VMEM_1_BASE || addr >= VMEM_1_LIMIT {
            return Err(if addr == va {
                CopyError::BadAddress
            } else {
                CopyError::Unterminated
            });
        }
        let page = addr >> PAGE_SHIFT;
        if checked_page != Some(page) {
            check_page(table, addr, VmProt::READ)?;
            checked_page = Some(page);
        }
        if read_byte(memory, table, addr)? == 0 {
            return Ok(addr - va);
        }
        addr += 1;
    }
}

/// Validate a NULL-terminated vector of string pointers
///
/// Each slot is a `WORD_SIZE` little-endian address. Every string it names
/// is validated too. Returns the string addresses in order.
pub fn validate_vector(memory: &[u8], table: &PageTable, va: usize) -> CopyResult<Vec<usize>> {
    let mut strings = Vec::new();
    let mut slot = va;
    loop {
        validate(table, slot, WORD_SIZE as isize, VmProt::READ).map_err(|e| {
            if slot != va && e == CopyError::BadAddress {
                CopyError::Unterminated
            } else {
                e
            }
        })?;
        let ptr = fuword32(memory, table, slot)? as usize;
        if ptr == 0 {
            return Ok(strings);
        }
        validate_str(memory, table, ptr)?;
        strings.push(ptr);
        slot += WORD_SIZE;
    }
}

// ============================================================================
// Copy primitives
// ============================================================================

fn phys(table: &PageTable, va: usize) -> CopyResult<usize> {
    table
        .translate(VMEM_1_BASE, va, VmProt::empty())
        .ok_or(CopyError::PageFault)
}

fn read_byte(memory: &[u8], table: &PageTable, va: usize) -> CopyResult<u8> {
    let pa = phys(table, va)?;
    memory.get(pa).copied().ok_or(CopyError::PageFault)
}

/// Copy `dst.len()` bytes from user address `src`
pub fn copyin(memory: &[u8], table: &PageTable, src: usize, dst: &mut [u8]) -> CopyResult {
    validate(table, src, dst.len() as isize, VmProt::READ)?;
    let mut done = 0;
    while done < dst.len() {
        let va = src + done;
        let chunk = (PAGE_SIZE - (va & (PAGE_SIZE - 1))).min(dst.len() - done);
        let pa = phys(table, va)?;
        let from = memory.get(pa..pa + chunk).ok_or(CopyError::PageFault)?;
        dst[done..done + chunk].copy_from_slice(from);
        done += chunk;
    }
    Ok(())
}

/// Copy `src` to user address `dst`
pub fn copyout(memory: &mut [u8], table: &PageTable, src: &[u8], dst: usize) -> CopyResult {
    validate(table, dst, src.len() as isize, VmProt::WRITE)?;
    let mut done = 0;
    while done < src.len() {
        let va = dst + done;
        let chunk = (PAGE_SIZE - (va & (PAGE_SIZE - 1))).min(src.len() - done);
        let pa = phys(table, va)?;
        let to = memory.get_mut(pa..pa + chunk).ok_or(CopyError::PageFault)?;
        to.copy_from_slice(&src[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated user string into a kernel `String`
pub fn copyinstr(memory: &[u8], table: &PageTable, src: usize) -> CopyResult<String> {
    let len = validate_str(memory, table, src)?;
    let mut bytes = alloc::vec![0u8; len];
    copyin(memory, table, src, &mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Fetch a user word
pub fn fuword32(memory: &[u8], table: &PageTable, src: usize) -> CopyResult<u32> {
    let mut word = [0u8; WORD_SIZE];
    copyin(memory, table, src, &mut word)?;
    Ok(u32::from_le_bytes(word))
}

/// Store a user word
pub fn suword32(memory: &mut [u8], table: &PageTable, dst: usize, value: u32) -> CopyResult {
    copyout(memory, table, &value.to_le_bytes(), dst)
}

// ============================================================================
// Tests
// ============================================================================
