//! Channel header layout and bounds-checked region access
//!
//! A channel region is laid out as
//!
//! ```text
//! offset  size  field
//!      0     4  magic          "FRLY"
//!      4     4  version
//!      8    16  lock           ShmRwLock (state u64, releases u32, owner_pid u32)
//!     24     4  width          pixels, 0 until first initialization
//!     28     4  height
//!     32     8  capture_time   ns, caller supplied
//!     40     8  write_time     ns since UNIX epoch, 0 = never written
//!     48     4  status         1 = live, 2 = closed
//!     52     4  producer_pid
//!     56     8  reserved
//!     64     .  payload        width * height * 3 bytes, row-major
//! ```
//!
//! Every field is an atomic so the header can be shared through `&` across
//! processes. Producer and consumers must be built against the same layout;
//! `magic`/`version` catch mismatches.

use crate::error::{RelayError, Result};
use crate::rwlock::ShmRwLock;
use crate::shm::RelayShm;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number for channel validation
pub const HEADER_MAGIC: u32 = 0x4652_4C59; // "FRLY"
pub const HEADER_VERSION: u32 = 1;

/// Size of the header; the payload starts right after it
pub const HEADER_SIZE: usize = 64;

/// 24-bit color
pub const BYTES_PER_PIXEL: usize = 3;

/// `write_time` of a channel that holds no frame yet
pub const NEVER_WRITTEN: u64 = 0;

/// Producer-side state advertised in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialized,
    Live,
    Closed,
}

impl ChannelStatus {
    fn to_raw(self) -> u32 {
        match self {
            ChannelStatus::Uninitialized => 0,
            ChannelStatus::Live => 1,
            ChannelStatus::Closed => 2,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ChannelStatus::Live,
            2 => ChannelStatus::Closed,
            _ => ChannelStatus::Uninitialized,
        }
    }
}

/// Frame description as stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRecord {
    pub width: u32,
    pub height: u32,
    pub capture_time: u64,
    pub write_time: u64,
}

impl FrameRecord {
    /// The channel holds a complete frame
    pub fn is_primed(&self) -> bool {
        self.width != 0 && self.height != 0 && self.write_time != NEVER_WRITTEN
    }

    pub fn payload_len(&self) -> Option<usize> {
        payload_len(self.width, self.height)
    }
}

/// Number of payload bytes for a frame, `None` on overflow
pub fn payload_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

/// Total region size for a channel of the given dimensions
pub fn region_size(width: u32, height: u32) -> Option<usize> {
    payload_len(width, height)?.checked_add(HEADER_SIZE)
}

/// Header at offset 0 of every channel region
#[repr(C, align(64))]
pub struct ChannelHeader {
    magic: AtomicU32,
    version: AtomicU32,
    lock: ShmRwLock,
    width: AtomicU32,
    height: AtomicU32,
    capture_time: AtomicU64,
    write_time: AtomicU64,
    status: AtomicU32,
    producer_pid: AtomicU32,
    _reserved: [u8; 8],
}

const _: () = {
    assert!(size_of::<ChannelHeader>() == HEADER_SIZE);
    assert!(offset_of!(ChannelHeader, magic) == 0);
    assert!(offset_of!(ChannelHeader, version) == 4);
    assert!(offset_of!(ChannelHeader, lock) == 8);
    assert!(size_of::<ShmRwLock>() == 16);
    assert!(offset_of!(ChannelHeader, width) == 24);
    assert!(offset_of!(ChannelHeader, height) == 28);
    assert!(offset_of!(ChannelHeader, capture_time) == 32);
    assert!(offset_of!(ChannelHeader, write_time) == 40);
    assert!(offset_of!(ChannelHeader, status) == 48);
    assert!(offset_of!(ChannelHeader, producer_pid) == 52);
};

impl ChannelHeader {
    /// Write a fresh header: unlocked lock in `epoch`, dimensions set, no frame
    ///
    /// `magic` is cleared first and published last, so a consumer never
    /// validates a half-written header.
    pub fn initialize(&self, width: u32, height: u32, epoch: u32) {
        self.magic.store(0, Ordering::Release);
        self.version.store(HEADER_VERSION, Ordering::Relaxed);
        self.lock.init(epoch);
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.capture_time.store(0, Ordering::Relaxed);
        self.write_time.store(NEVER_WRITTEN, Ordering::Relaxed);
        self.producer_pid
            .store(std::process::id(), Ordering::Relaxed);
        self.status
            .store(ChannelStatus::Live.to_raw(), Ordering::Relaxed);
        self.magic.store(HEADER_MAGIC, Ordering::Release);
    }

    /// Rebuild the header in place after the lock got wedged
    ///
    /// Metadata is rewritten while the wedged lock still keeps newcomers out;
    /// the lock reset then publishes it. Returns the new lock epoch.
    pub fn reconstruct(&self, width: u32, height: u32) -> u32 {
        self.write_time.store(NEVER_WRITTEN, Ordering::Relaxed);
        self.capture_time.store(0, Ordering::Relaxed);
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.lock.reset()
    }

    /// Check that this header was written by a compatible build
    ///
    /// Returns `Ok(false)` while the producer has not finished writing it.
    pub fn validate(&self) -> Result<bool> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic == 0 {
            return Ok(false);
        }

        let version = self.version.load(Ordering::Relaxed);
        if magic != HEADER_MAGIC || version != HEADER_VERSION {
            return Err(RelayError::LayoutMismatch {
                expected_magic: HEADER_MAGIC,
                got_magic: magic,
                expected_version: HEADER_VERSION,
                got_version: version,
            });
        }
        Ok(true)
    }

    #[inline(always)]
    pub fn lock(&self) -> &ShmRwLock {
        &self.lock
    }

    /// Current frame description
    ///
    /// Only consistent while the lock is held, except that a given
    /// `write_time` is never visible before its payload.
    #[inline]
    pub fn record(&self) -> FrameRecord {
        let write_time = self.write_time.load(Ordering::Acquire);
        FrameRecord {
            width: self.width.load(Ordering::Relaxed),
            height: self.height.load(Ordering::Relaxed),
            capture_time: self.capture_time.load(Ordering::Relaxed),
            write_time,
        }
    }

    /// Store a frame description; `write_time` goes last
    #[inline]
    pub fn store_record(&self, record: &FrameRecord) {
        self.width.store(record.width, Ordering::Relaxed);
        self.height.store(record.height, Ordering::Relaxed);
        self.capture_time
            .store(record.capture_time, Ordering::Relaxed);
        self.write_time.store(record.write_time, Ordering::Release);
    }

    #[inline]
    pub fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Acquire)
    }

    /// Dimensions announced by the producer
    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Relaxed),
            self.height.load(Ordering::Relaxed),
        )
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ChannelStatus) {
        self.status.store(status.to_raw(), Ordering::Release);
    }

    pub fn producer_pid(&self) -> u32 {
        self.producer_pid.load(Ordering::Relaxed)
    }
}

/// A mapped channel: header plus payload, with bounds-checked access
pub struct ChannelRegion {
    shm: RelayShm,
}

impl ChannelRegion {
    /// Wrap a mapping, checking it can hold a header
    pub fn new(shm: RelayShm) -> Result<Self> {
        if shm.size() < HEADER_SIZE {
            return Err(RelayError::RegionTooSmall {
                required: HEADER_SIZE,
                actual: shm.size(),
            });
        }
        // mmap hands out page-aligned addresses
        debug_assert_eq!(shm.as_ptr() as usize % align_of::<ChannelHeader>(), 0);
        Ok(Self { shm })
    }

    #[inline(always)]
    pub fn header(&self) -> &ChannelHeader {
        // SAFETY: size and alignment checked in `new`; all fields are atomics
        // (or never-touched padding) for which any bit pattern is valid
        unsafe { &*(self.shm.as_ptr() as *const ChannelHeader) }
    }

    /// Bytes available after the header
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.shm.size() - HEADER_SIZE
    }

    /// Whether a `width` x `height` frame fits in this mapping
    pub fn fits(&self, width: u32, height: u32) -> bool {
        payload_len(width, height).is_some_and(|len| len <= self.payload_capacity())
    }

    #[inline]
    fn payload_ptr(&self, len: usize) -> Option<*mut u8> {
        // SAFETY: HEADER_SIZE <= size, checked in `new`
        (len <= self.payload_capacity()).then(|| unsafe { self.shm.as_ptr().add(HEADER_SIZE) })
    }

    /// Copy `src` to the start of the payload; `false` if it does not fit
    ///
    /// Callers hold the header lock exclusively, or explicitly accept torn
    /// reads on the other side.
    pub fn write_payload(&self, src: &[u8]) -> bool {
        match self.payload_ptr(src.len()) {
            Some(dst) => {
                // SAFETY: bounds checked above; the mapping never overlaps `src`
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
                true
            }
            None => false,
        }
    }

    /// Copy the first `dst.len()` payload bytes out; `false` if out of range
    pub fn read_payload(&self, dst: &mut [u8]) -> bool {
        match self.payload_ptr(dst.len()) {
            Some(src) => {
                // SAFETY: bounds checked above
                unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
                true
            }
            None => false,
        }
    }

    /// Borrow the first `len` payload bytes in place
    ///
    /// # Safety
    /// The caller must hold the header lock in shared mode for as long as the
    /// slice is alive, so no producer writes into it.
    pub unsafe fn payload(&self, len: usize) -> Option<&[u8]> {
        self.payload_ptr(len)
            .map(|ptr| std::slice::from_raw_parts(ptr as *const u8, len))
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn size(&self) -> usize {
        self.shm.size()
    }

    pub fn created(&self) -> bool {
        self.shm.created()
    }

    pub fn set_remove_on_drop(&mut self, remove: bool) {
        self.shm.set_remove_on_drop(remove);
    }
}
