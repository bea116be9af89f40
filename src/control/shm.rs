use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use super::FlowSlot;
use crate::error::{PacerError, PacerResult};

/// A flow table mapped from a named POSIX shared memory object.
pub struct SharedRegion {
    name: String,
    c_name: CString,
    ptr: NonNull<FlowSlot>,
    len: usize,
}

// The mapping is only accessed through atomics
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn os_error(op: &'static str, name: &str, source: io::Error) -> PacerError {
    PacerError::SharedMemory {
        op,
        name: name.to_string(),
        source,
    }
}

impl SharedRegion {
    /// Creates (or reuses) the named object, sizes it for `len` slots, maps it, and zeroes it.
    pub fn create(name: &str, len: usize) -> PacerResult<Self> {
        let c_name = CString::new(name).map_err(|_| {
            os_error(
                "shm_open",
                name,
                io::Error::new(io::ErrorKind::InvalidInput, "name contains a nul byte"),
            )
        })?;

        let size = len * mem::size_of::<FlowSlot>();

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666);
            if fd < 0 {
                return Err(os_error("shm_open", name, io::Error::last_os_error()));
            }

            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(os_error("ftruncate", name, err));
            }

            let addr = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let err = io::Error::last_os_error();
            libc::close(fd);

            if addr == libc::MAP_FAILED {
                return Err(os_error("mmap", name, err));
            }

            // All-zero bytes are a free slot
            ptr::write_bytes(addr as *mut u8, 0, size);

            let ptr = NonNull::new(addr as *mut FlowSlot)
                .ok_or_else(|| os_error("mmap", name, io::Error::from(io::ErrorKind::Other)))?;

            Ok(Self {
                name: name.to_string(),
                c_name,
                ptr,
                len,
            })
        }
    }

    pub fn slots(&self) -> &[FlowSlot] {
        // Page-aligned, sized for `len` slots, and valid until drop
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Removes the name. The mapping stays valid until drop.
    pub fn unlink(&self) -> PacerResult<()> {
        if unsafe { libc::shm_unlink(self.c_name.as_ptr()) } != 0 {
            return Err(os_error("shm_unlink", &self.name, io::Error::last_os_error()));
        }

        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len * mem::size_of::<FlowSlot>(),
            );
        }
    }
}
