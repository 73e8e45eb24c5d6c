//! Shared-memory buffer mapping via memfd

use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};

use crate::buffer::{MapError, MappedRegion, MemoryMapper};

/// Maps anonymous shared memory (`memfd_create` + `mmap`).
///
/// Each mapping gets its own descriptor, so it can be handed to a display
/// or driver process.
pub struct SharedMemoryMapper {
    name: CString,
}

impl SharedMemoryMapper {
    pub fn new(name: &str) -> Result<Self, MapError> {
        let name = CString::new(name)
            .map_err(|e| MapError::Os(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        Ok(Self { name })
    }
}

fn close_fd(fd: i32) {
    // SAFETY: fd was returned by memfd_create and is owned by the caller
    unsafe { libc::close(fd) };
}

impl MemoryMapper for SharedMemoryMapper {
    fn map(&self, length: usize) -> Result<MappedRegion, MapError> {
        if length == 0 {
            return Err(MapError::ZeroLength);
        }

        let fd = unsafe { libc::memfd_create(self.name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let Ok(size) = libc::off_t::try_from(length) else {
            close_fd(fd);
            return Err(MapError::OutOfMemory(length));
        };
        if unsafe { libc::ftruncate(fd, size) } != 0 {
            let err = io::Error::last_os_error();
            close_fd(fd);
            return Err(err.into());
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            close_fd(fd);
            return Err(err.into());
        }

        let Some(base) = NonNull::new(addr.cast::<u8>()) else {
            close_fd(fd);
            return Err(MapError::OutOfMemory(length));
        };

        // SAFETY: the mapping is readable and writable for `length` bytes
        // until `unmap` releases it
        Ok(unsafe { MappedRegion::from_raw_parts(fd, base, length) })
    }

    fn unmap(&self, region: MappedRegion) -> Result<(), MapError> {
        let rc = unsafe { libc::munmap(region.as_ptr().cast::<libc::c_void>(), region.len()) };
        let result = if rc != 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        };
        close_fd(region.descriptor());
        result
    }
}
