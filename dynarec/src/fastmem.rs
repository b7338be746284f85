//! A fast memory window: 4GiB (plus a guard) of reserved address space in which guest RAM is
//! mapped at its guest address and everything else is inaccessible.
//!
//! Generated code adds a 32-bit guest address to the window's base and accesses the result
//! directly. An access to RAM just works; an access to anything else faults, which the backend
//! turns into a call to the guest's slow path.

use crate::guest::{AccessWidth, GuestAddr};
use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
    c_void, mmap, mprotect, munmap,
};
use std::{io, ptr, ptr::NonNull, slice};

/// The bytes reserved: the whole 32-bit guest address space plus a guard large enough for the
/// widest access straddling the top.
const RESERVED: usize = (1 << 32) + (1 << 16);

pub struct FastmemWindow {
    base: NonNull<u8>,
    /// The bytes of RAM, mapped from guest address 0.
    ram_len: usize,
}

impl FastmemWindow {
    /// Reserve a window and map `ram_len` bytes of zeroed RAM at guest address 0.
    pub fn new(ram_len: usize) -> Result<Self, io::Error> {
        let ram_len = ram_len.next_multiple_of(page_size::get());
        if ram_len > 1 << 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "guest RAM larger than the guest address space",
            ));
        }
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                RESERVED,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if ram_len > 0 && unsafe { mprotect(base, ram_len, PROT_READ | PROT_WRITE) } != 0 {
            let e = io::Error::last_os_error();
            unsafe {
                munmap(base, RESERVED);
            }
            return Err(e);
        }
        Ok(Self {
            base: NonNull::new(base.cast()).ok_or_else(io::Error::last_os_error)?,
            ram_len,
        })
    }

    /// The host address of guest address 0.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn ram_len(&self) -> usize {
        self.ram_len
    }

    /// Guest RAM.
    pub fn ram(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.ram_len) }
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.ram_len) }
    }

    /// If the `width` bytes at `addr` are RAM, return a host pointer to them.
    pub fn translate(&self, addr: GuestAddr, width: AccessWidth) -> Option<NonNull<u8>> {
        let addr = addr as usize;
        if addr + width.bytes() <= self.ram_len {
            // In bounds of the mapping, so non-null.
            NonNull::new(unsafe { self.base.as_ptr().add(addr) })
        } else {
            None
        }
    }
}

impl Drop for FastmemWindow {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base.as_ptr() as *mut c_void, RESERVED);
        }
    }
}
