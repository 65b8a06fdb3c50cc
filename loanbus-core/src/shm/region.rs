//! SharedMemoryRegion - POSIX shared memory wrapper.
//!
//! Provides safe abstraction over mmap and shm_open for zero-copy IPC.
//! All unsafe operations are encapsulated with bounds checking.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::SharedMemoryError;

/// Represents a mapped shared memory region.
///
/// This struct owns the mapped memory and will unmap it on drop.
/// Named regions can be shared between processes using the same name;
/// anonymous regions are shared with children forked after creation.
pub struct SharedMemoryRegion {
    /// Name of the shared memory object (empty for anonymous mappings).
    name: String,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
    /// File descriptor for the shared memory object, -1 when anonymous.
    fd: i32,
    /// Whether this instance created the SHM (and should unlink on drop).
    is_owner: bool,
}

// SAFETY: SharedMemoryRegion can be sent between threads as it owns its memory.
unsafe impl Send for SharedMemoryRegion {}

// SAFETY: all shared mutation inside the region goes through atomics.
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Minimum size for a shared memory region.
    pub const MIN_SIZE: usize = 4096;

    /// Maximum size for a shared memory region (1 GB).
    pub const MAX_SIZE: usize = 1024 * 1024 * 1024;

    /// Create a new named shared memory region.
    ///
    /// # Arguments
    /// * `name` - Name of the shared memory object (will be prefixed with /)
    /// * `size` - Size in bytes (must be between MIN_SIZE and MAX_SIZE)
    ///
    /// # Errors
    /// Returns SharedMemoryError if creation or mapping fails.
    pub fn create(name: &str, size: usize) -> Result<Self, SharedMemoryError> {
        Self::validate_size(name, size)?;

        if name.is_empty() {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: "Name cannot be empty".to_string(),
            });
        }

        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString, flags are valid POSIX flags
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EEXIST) {
                return Err(SharedMemoryError::CreateFailed {
                    name: name.to_string(),
                    reason: "Shared memory already exists".to_string(),
                });
            }
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", errno),
            });
        }

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if result < 0 {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: format!("ftruncate failed: {}", errno),
            });
        }

        let ptr = match Self::map(fd, size, libc::MAP_SHARED) {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe { libc::close(fd) };
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        // Zero-initialize the memory
        // SAFETY: ptr is valid, size is the correct length
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!(name = %name, size = size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd,
            is_owner: true,
        })
    }

    /// Open an existing named shared memory region.
    ///
    /// The mapping size is taken from the object itself.
    pub fn open(name: &str) -> Result<Self, SharedMemoryError> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            return Err(SharedMemoryError::OpenFailed {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", std::io::Error::last_os_error()),
            });
        }

        // SAFETY: fd is valid and stat is a plain C struct
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(SharedMemoryError::OpenFailed {
                name: name.to_string(),
                reason: format!("fstat failed: {}", errno),
            });
        }

        let size = stat.st_size as usize;
        if let Err(e) = Self::validate_size(name, size) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let ptr = match Self::map(fd, size, libc::MAP_SHARED) {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        tracing::debug!(name = %name, size = size, "Opened shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd,
            is_owner: false,
        })
    }

    /// Create an anonymous shared mapping.
    ///
    /// Not reachable by name; shared with the creating process's threads and
    /// with children forked after this call.
    pub fn anonymous(size: usize) -> Result<Self, SharedMemoryError> {
        Self::validate_size("<anonymous>", size)?;

        // MAP_ANONYMOUS memory is zero-filled by the kernel.
        let ptr = Self::map(-1, size, libc::MAP_SHARED | libc::MAP_ANONYMOUS)?;

        tracing::debug!(size = size, "Created anonymous shared mapping");

        Ok(Self {
            name: String::new(),
            ptr,
            size,
            fd: -1,
            is_owner: false,
        })
    }

    /// Remove a named shared memory object without mapping it.
    pub fn unlink(name: &str) -> Result<(), SharedMemoryError> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(SharedMemoryError::UnlinkFailed {
                name: name.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        tracing::debug!(name = %name, "Unlinked shared memory region");
        Ok(())
    }

    fn validate_size(name: &str, size: usize) -> Result<(), SharedMemoryError> {
        if size < Self::MIN_SIZE {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: format!("Size {} is below minimum {}", size, Self::MIN_SIZE),
            });
        }
        if size > Self::MAX_SIZE {
            return Err(SharedMemoryError::SegmentTooLarge {
                size,
                max: Self::MAX_SIZE,
            });
        }
        Ok(())
    }

    fn c_name(name: &str) -> Result<CString, SharedMemoryError> {
        let shm_name = format!("/{}", name);
        CString::new(shm_name.as_str()).map_err(|e| SharedMemoryError::CreateFailed {
            name: name.to_string(),
            reason: format!("Invalid name: {}", e),
        })
    }

    fn map(fd: i32, size: usize, flags: libc::c_int) -> Result<NonNull<u8>, SharedMemoryError> {
        // SAFETY: fd is valid (or -1 with MAP_ANONYMOUS), size is validated, offset 0 is valid
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(SharedMemoryError::MapFailed {
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        NonNull::new(ptr as *mut u8).ok_or_else(|| SharedMemoryError::MapFailed {
            reason: "mmap returned null".to_string(),
        })
    }

    /// Get the name of this shared memory region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of this shared memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this mapping will unlink the object on drop.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Get a raw pointer to the shared memory.
    ///
    /// Callers must ensure proper synchronization when accessing the memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }

        if self.fd >= 0 {
            // SAFETY: fd was opened during creation
            unsafe { libc::close(self.fd) };
        }

        if self.is_owner {
            if let Ok(c_name) = Self::c_name(&self.name) {
                // SAFETY: c_name is a valid CString
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                tracing::debug!(name = %self.name, "Unlinked shared memory region");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_size_validation() {
        assert!(SharedMemoryRegion::create("test-small", 100).is_err());
        assert!(
            SharedMemoryRegion::create("test-large", SharedMemoryRegion::MAX_SIZE + 1).is_err()
        );
        assert!(SharedMemoryRegion::anonymous(100).is_err());
    }

    #[test]
    fn test_shm_empty_name() {
        assert!(SharedMemoryRegion::create("", 4096).is_err());
    }

    #[test]
    fn test_anonymous_mapping_is_zeroed() {
        let region = SharedMemoryRegion::anonymous(8192).unwrap();
        assert_eq!(region.size(), 8192);
        assert!(!region.is_owner());
        // SAFETY: region is mapped for 8192 bytes and not shared yet
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
