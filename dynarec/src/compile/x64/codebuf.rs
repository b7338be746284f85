//! The executable memory blocks and trampolines live in.
//!
//! One mapping holds two regions. The "near" region holds translated blocks and is reset when
//! the cache is cleared. The "far" region starts with the shared entry and exit routines, which
//! live as long as the buffer, followed by backpatch trampolines. Both regions are within a
//! `rel32` jump of each other.
//!
//! The mapping is readable, writable and executable for its whole life. Code that may already
//! have run must only be changed through [CodeBuf::patch].

use libc::{
    MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, c_void, mmap, munmap,
};
use std::{io, ops::Range, ptr, slice};

#[derive(Debug)]
pub(super) struct CodeBuf {
    /// A pointer to the beginning of the `mmap`ed buffer.
    buf: *mut u8,
    /// How many bytes have we allocated to the buffer?
    len: usize,
    /// The size of the near region, which starts at offset 0.
    near_len: usize,
}

impl CodeBuf {
    /// Map a buffer whose near region is at least `near_len` bytes and whose far region is at
    /// least `far_len` bytes.
    pub(super) fn new(near_len: usize, far_len: usize) -> Result<Self, io::Error> {
        let near_len = near_len.next_multiple_of(page_size::get());
        let len = near_len + far_len.next_multiple_of(page_size::get());
        if len > i32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "code buffer too large for rel32 branches",
            ));
        }
        let buf = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            buf: buf.cast(),
            len,
            near_len,
        })
    }

    /// The host address of offset 0.
    pub(super) fn base(&self) -> usize {
        self.buf.addr()
    }

    pub(super) fn near(&self) -> Range<usize> {
        self.base()..self.base() + self.near_len
    }

    pub(super) fn far(&self) -> Range<usize> {
        self.base() + self.near_len..self.base() + self.len
    }

    pub(super) fn contains(&self, addr: usize) -> bool {
        (self.base()..self.base() + self.len).contains(&addr)
    }

    /// Copy freshly assembled code, which nothing can yet jump to, to `addr`.
    pub(super) fn write(&mut self, addr: usize, code: &[u8]) {
        self.copy_in(addr, code);
    }

    /// Overwrite code at `addr` which may already have run.
    ///
    /// Patching happens on the thread that runs the code (either from the dispatcher or from the
    /// fault handler, while the code is stopped), so plain stores are coherent with instruction
    /// fetch on x64.
    pub(super) fn patch(&self, addr: usize, code: &[u8]) {
        self.copy_in(addr, code);
    }

    fn copy_in(&self, addr: usize, code: &[u8]) {
        assert!(addr >= self.base() && addr + code.len() <= self.base() + self.len);
        unsafe {
            self.buf
                .byte_add(addr - self.base())
                .copy_from_nonoverlapping(code.as_ptr(), code.len());
        }
    }

    /// The bytes at `range`.
    pub(super) fn bytes(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start >= self.base() && range.end <= self.base() + self.len);
        unsafe { slice::from_raw_parts(self.buf.byte_add(range.start - self.base()), range.len()) }
    }
}

impl Drop for CodeBuf {
    fn drop(&mut self) {
        unsafe {
            munmap(self.buf as *mut c_void, self.len);
        }
    }
}
