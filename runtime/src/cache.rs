//! The dual-view code cache.
//!
//! Cache pages are reachable through two addresses: an execute view that
//! threads run from, and a writable alias the emitters store through. All
//! patching goes `pc -> writable_addr(pc) -> store`, so the execute mapping
//! never needs its protections flipped.
//!
//! The in-memory variant backs both views with one heap allocation (the
//! views coincide); the unix variant maps one memfd twice.

use crate::CachePc;

enum Backing {
    /// One heap allocation; execute and writable views coincide. The box is
    /// never touched after construction except to drop it.
    Heap(#[allow(dead_code)] Box<[u8]>),
    #[cfg(target_os = "linux")]
    Mapped { writable: *mut u8, fd: libc::c_int },
}

pub struct CodeCache {
    exec: *mut u8,
    len: usize,
    /// `writable - exec`, applied to translate patch addresses.
    writable_delta: isize,
    /// Cache-line granule for the 4-byte patch-containment rule.
    line_size: usize,
    backing: Backing,
}

impl CodeCache {
    /// A cache whose two views coincide in one heap buffer. This is what the
    /// tests and single-process embedders use.
    #[must_use]
    pub fn new_in_memory(len: usize, line_size: usize) -> Self {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let exec = buf.as_mut_ptr();
        Self {
            exec,
            len,
            writable_delta: 0,
            line_size,
            backing: Backing::Heap(buf),
        }
    }

    /// First executable address of the cache.
    #[must_use]
    pub fn base_pc(&self) -> CachePc {
        self.exec as CachePc
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    #[must_use]
    pub fn contains(&self, pc: CachePc) -> bool {
        pc >= self.base_pc() && pc < self.base_pc() + self.len
    }

    /// Translate an executable address to its writable alias.
    #[must_use]
    pub fn writable_addr(&self, pc: CachePc) -> *mut u8 {
        debug_assert!(self.contains(pc));
        (pc as isize + self.writable_delta) as *mut u8
    }

    /// Copy `bytes` into the cache at `pc` through the writable alias.
    pub fn write_bytes(&self, pc: CachePc, bytes: &[u8]) {
        debug_assert!(pc + bytes.len() <= self.base_pc() + self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.writable_addr(pc), bytes.len());
        }
    }

    #[must_use]
    pub fn read_u8(&self, pc: CachePc) -> u8 {
        debug_assert!(self.contains(pc));
        unsafe { std::ptr::read(self.writable_addr(pc)) }
    }

    #[must_use]
    pub fn read_i32(&self, pc: CachePc) -> i32 {
        debug_assert!(self.contains(pc) && self.contains(pc + 3));
        let mut raw = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.writable_addr(pc), raw.as_mut_ptr(), 4);
        }
        i32::from_le_bytes(raw)
    }

    /// Copy `len` bytes out of the cache starting at `pc`.
    #[must_use]
    pub fn read_bytes(&self, pc: CachePc, len: usize) -> Vec<u8> {
        debug_assert!(pc + len <= self.base_pc() + self.len);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.writable_addr(pc), out.as_mut_ptr(), len);
        }
        out
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        impl CodeCache {
            /// A cache backed by a memfd mapped twice: read-execute and
            /// read-write.
            pub fn new_dual_mapped(len: usize, line_size: usize) -> std::io::Result<Self> {
                use std::io::Error;
                unsafe {
                    let fd = libc::memfd_create(b"fraglink-cache\0".as_ptr().cast(), 0);
                    if fd < 0 {
                        return Err(Error::last_os_error());
                    }
                    if libc::ftruncate(fd, len as libc::off_t) != 0 {
                        let err = Error::last_os_error();
                        libc::close(fd);
                        return Err(err);
                    }
                    let exec = libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_EXEC,
                        libc::MAP_SHARED,
                        fd,
                        0,
                    );
                    if exec == libc::MAP_FAILED {
                        let err = Error::last_os_error();
                        libc::close(fd);
                        return Err(err);
                    }
                    let writable = libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        fd,
                        0,
                    );
                    if writable == libc::MAP_FAILED {
                        let err = Error::last_os_error();
                        libc::munmap(exec, len);
                        libc::close(fd);
                        return Err(err);
                    }
                    let exec = exec.cast::<u8>();
                    let writable = writable.cast::<u8>();
                    Ok(Self {
                        exec,
                        len,
                        writable_delta: (writable as isize) - (exec as isize),
                        line_size,
                        backing: Backing::Mapped { writable, fd },
                    })
                }
            }
        }
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Backing::Mapped { writable, fd } = &self.backing {
            unsafe {
                libc::munmap(writable.cast(), self.len);
                libc::munmap(self.exec.cast(), self.len);
                libc::close(*fd);
            }
        }
    }
}

// The cache hands out raw addresses; synchronization of mutation is the
// patching protocol's concern (single aligned stores), not the type's.
unsafe impl Send for CodeCache {}
unsafe impl Sync for CodeCache {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_views_coincide() {
        let cache = CodeCache::new_in_memory(4096, 64);
        let pc = cache.base_pc() + 16;
        assert_eq!(cache.writable_addr(pc) as usize, pc);
        cache.write_bytes(pc, &[0xde, 0xad]);
        assert_eq!(cache.read_u8(pc), 0xde);
        assert_eq!(cache.read_u8(pc + 1), 0xad);
    }

    #[cfg(all(unix, target_os = "linux"))]
    #[test]
    fn dual_mapped_aliases() {
        let cache = match CodeCache::new_dual_mapped(4096, 64) {
            Ok(c) => c,
            // memfd may be unavailable in sandboxed test environments
            Err(_) => return,
        };
        let pc = cache.base_pc();
        cache.write_bytes(pc, &[0xc3]);
        assert_eq!(cache.read_u8(pc), 0xc3);
        assert_ne!(cache.writable_addr(pc) as usize, pc);
    }
}
