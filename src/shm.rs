//! Low-level POSIX shared memory operations

use crate::error::{RelayError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const RELAY_SHM_PREFIX: &str = "/relay_";
const MAX_NAME_LEN: usize = 255 - RELAY_SHM_PREFIX.len();
const CREATE_ATTEMPTS: u32 = 4;

/// Handle to a mapped shared memory region
pub struct RelayShm {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    created: bool,
    remove_on_drop: bool,
}

// SAFETY: the mapping is plain memory; every access to shared state goes
// through atomics in the channel header or through the header lock.
unsafe impl Send for RelayShm {}
unsafe impl Sync for RelayShm {}

fn shm_path(name: &str) -> Result<CString> {
    let invalid = |reason| RelayError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if name.contains('/') {
        return Err(invalid("name must not contain '/'"));
    }

    CString::new(format!("{}{}", RELAY_SHM_PREFIX, name))
        .map_err(|_| invalid("name must not contain NUL bytes"))
}

/// Current size of the object behind `fd`
fn object_size(fd: &OwnedFd) -> std::result::Result<usize, Errno> {
    let stat = rustix::fs::fstat(fd)?;
    Ok(usize::try_from(stat.st_size).unwrap_or(0))
}

/// Map `size` bytes of `fd` read/write and shared
fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing we own
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| RelayError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| RelayError::Mmap(std::io::Error::other("mmap returned null")))
}

impl RelayShm {
    /// Create the named region, or open and resize it if it already exists
    ///
    /// The region ends up exactly `size` bytes long. Newly grown bytes are
    /// zero-filled by the kernel; existing bytes are left untouched. An
    /// existing region larger than `size` is never shrunk, because other
    /// processes may still have its tail mapped: it is unlinked and a fresh
    /// one is created under the same name.
    pub fn create_or_open(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_path(name)?;
        let create_err = |e: Errno| RelayError::ChannelCreate {
            name: name.to_string(),
            source: e.into(),
        };

        let mut attempts = 0;
        let (fd, created) = loop {
            attempts += 1;
            if attempts > CREATE_ATTEMPTS {
                return Err(create_err(Errno::EXIST));
            }

            // Try to create exclusively first, fall back to open if it exists
            match shm_open(
                c_name.as_c_str(),
                ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
                Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
            ) {
                Ok(fd) => break (fd, true),
                Err(e) if e == Errno::EXIST => {}
                Err(e) => return Err(create_err(e)),
            }

            let fd = match shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()) {
                Ok(fd) => fd,
                // Unlinked between the two opens
                Err(e) if e == Errno::NOENT => continue,
                Err(e) => return Err(create_err(e)),
            };

            let current = object_size(&fd).map_err(create_err)?;
            if current <= size {
                break (fd, false);
            }

            tracing::debug!(
                channel = name,
                current,
                size,
                "existing region is larger, replacing it instead of shrinking"
            );
            match shm_unlink(c_name.as_c_str()) {
                Ok(()) => {}
                Err(e) if e == Errno::NOENT => {}
                Err(e) => return Err(create_err(e)),
            }
        };

        ftruncate(&fd, size as u64).map_err(|e| RelayError::Truncate(e.into()))?;
        let addr = map_shared(&fd, size)?;

        tracing::debug!(channel = name, size, created, "mapped channel region");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            created,
            remove_on_drop: false,
        })
    }

    /// Open an existing region at whatever size it currently has
    ///
    /// A region that has not been sized yet counts as missing.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_path(name)?;
        let not_found = || RelayError::ChannelNotFound {
            name: name.to_string(),
        };

        let fd = match shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) if e == Errno::NOENT => return Err(not_found()),
            Err(e) => {
                return Err(RelayError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
        };

        let size = object_size(&fd).map_err(|e| RelayError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        if size == 0 {
            return Err(not_found());
        }

        let addr = map_shared(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            created: false,
            remove_on_drop: false,
        })
    }

    /// Unlink a named region
    ///
    /// Returns `false` if there was nothing to remove. Existing mappings stay
    /// valid until they are dropped.
    pub fn remove(name: &str) -> Result<bool> {
        let c_name = shm_path(name)?;
        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => Ok(true),
            Err(e) if e == Errno::NOENT => Ok(false),
            Err(e) => Err(RelayError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Unlink the region when this handle is dropped
    pub fn set_remove_on_drop(&mut self, remove: bool) {
        self.remove_on_drop = remove;
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the channel name (without the system prefix)
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the region rather than reopening it
    #[inline(always)]
    pub fn created(&self) -> bool {
        self.created
    }
}

impl Drop for RelayShm {
    fn drop(&mut self) {
        // SAFETY: addr/size describe the mapping made in the constructor
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.remove_on_drop {
            match Self::remove(&self.name) {
                Ok(_) => tracing::debug!(channel = %self.name, "removed channel region"),
                Err(e) => tracing::warn!(channel = %self.name, error = %e, "failed to remove channel"),
            }
        }
    }
}
