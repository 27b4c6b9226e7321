//! Executable memory management using mmap.
//!
//! The [`ExecutionBuffer`] owns a page-aligned mapping that starts out
//! read-write for code emission and is flipped to read-execute exactly once
//! at finalize time. The mapping is never writable and executable at the
//! same time, and its base address stays stable for the buffer's lifetime.

use std::ptr::NonNull;

use crate::core::error::{JitError, JitResult};

/// A block of memory for generated code, writable until protected.
pub struct ExecutionBuffer {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutionBuffer {
    /// Map a read-write region of at least `capacity` bytes, rounded up to
    /// the page size.
    pub fn new(capacity: usize) -> JitResult<Self> {
        if capacity == 0 {
            return Err(JitError::ZeroCapacity);
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let size = (capacity + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::MemoryAllocation { size });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(JitError::MemoryAllocation { size })?;

        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    /// Mapped size in bytes (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` into the mapping at `offset`. Fails once the region has
    /// been made executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> JitResult<()> {
        if self.executable {
            return Err(JitError::BufferProtected);
        }
        if offset + data.len() > self.size {
            return Err(JitError::BufferOverflow {
                position: offset,
                requested: data.len(),
                capacity: self.size,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the mapping to read-execute. After this no further writes are
    /// accepted; generated code may run.
    pub fn make_executable(&mut self) -> JitResult<()> {
        if self.executable {
            return Ok(());
        }
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(JitError::MemoryProtection);
        }
        self.executable = true;
        Ok(())
    }

    /// Base address of the mapping.
    pub fn entry(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Reinterpret the buffer start as a callable of type `F`.
    ///
    /// # Safety
    ///
    /// The caller must ensure the buffer holds valid machine code whose ABI
    /// matches `F`, that `make_executable` has succeeded, and that the
    /// returned callable is not invoked after this buffer is dropped.
    pub unsafe fn as_fn<F: Copy>(&self) -> JitResult<F> {
        if !self.executable {
            return Err(JitError::NotFinalized);
        }
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const u8>());
        let entry = self.ptr.as_ptr();
        Ok(std::mem::transmute_copy(&entry))
    }
}

impl Drop for ExecutionBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The buffer owns its mapping exclusively; the raw pointer is not shared.
unsafe impl Send for ExecutionBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rounds_to_page() {
        let buf = ExecutionBuffer::new(100).unwrap();
        assert!(buf.size() >= 100);
        assert_eq!(buf.size() % 4096, 0);
        assert!(!buf.is_executable());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(ExecutionBuffer::new(0).is_err());
    }

    #[test]
    fn test_write_then_protect() {
        let mut buf = ExecutionBuffer::new(4096).unwrap();
        buf.write(0, &[0xc3]).unwrap(); // ret
        buf.make_executable().unwrap();
        assert!(buf.is_executable());
    }

    #[test]
    fn test_write_after_protect_fails() {
        let mut buf = ExecutionBuffer::new(4096).unwrap();
        buf.make_executable().unwrap();
        assert_eq!(buf.write(0, &[0x90]), Err(JitError::BufferProtected));
    }

    #[test]
    fn test_as_fn_requires_protection() {
        let buf = ExecutionBuffer::new(4096).unwrap();
        let result = unsafe { buf.as_fn::<extern "C" fn()>() };
        assert_eq!(result.err(), Some(JitError::NotFinalized));
    }
}
