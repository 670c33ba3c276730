//! High-level channel API
//!
//! A channel is one named shared memory region holding a single frame slot.
//! [`FrameSender`] owns the region and overwrites the slot; any number of
//! [`FrameReceiver`]s poll it for frames newer than the last one they saw.

use crate::error::{RelayError, Result};
use crate::frame::{checked_payload_len, now_nanos, resize_nearest, Frame};
use crate::header::{region_size, ChannelRegion, ChannelStatus, FrameRecord};
use crate::rwlock::{LockSnapshot, SharedGuard};
use crate::shm::RelayShm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default bound on lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a receiver keeps a mapping whose producer has closed before
/// looking the name up again
const REATTACH_INTERVAL: Duration = Duration::from_millis(250);

/// How the producer acquires the header lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    /// Wait up to the timeout; if the lock is wedged, rebuild the header and
    /// drop the frame
    #[default]
    TimedExclusive,
    /// Publisher priority: one attempt, drop the frame if the lock is taken
    TryOnce,
    /// Reader priority: let readers finish for up to the timeout, then drop
    /// the frame. Never rebuilds the header.
    YieldToReaders,
    /// No locking at all. Readers may observe torn frames.
    Unlocked,
}

/// Producer-side channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frame width in pixels; incoming frames are rescaled to it
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bound on lock acquisition per publish
    pub lock_timeout: Duration,
    /// Unlink the region when the sender goes away
    pub auto_remove: bool,
    pub lock_policy: LockPolicy,
}

impl ChannelConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auto_remove: true,
            lock_policy: LockPolicy::TimedExclusive,
        }
    }
}

/// Outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// The frame is in the slot
    Published { write_time: u64 },
    /// The lock could not be taken in time. If `reconstructed` is set, the
    /// header was rebuilt and the next publish starts from a clean lock.
    SkippedTimeout { reconstructed: bool },
    /// The lock was taken and the policy does not wait
    SkippedBusy,
}

impl PublishStatus {
    #[inline]
    pub fn is_published(&self) -> bool {
        matches!(self, PublishStatus::Published { .. })
    }
}

/// Running totals of publish outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderCounters {
    pub published: u64,
    pub skipped_busy: u64,
    pub skipped_timeout: u64,
    pub reconstructions: u64,
}

impl SenderCounters {
    fn record(&mut self, status: PublishStatus) {
        match status {
            PublishStatus::Published { .. } => self.published += 1,
            PublishStatus::SkippedBusy => self.skipped_busy += 1,
            PublishStatus::SkippedTimeout { reconstructed } => {
                self.skipped_timeout += 1;
                if reconstructed {
                    self.reconstructions += 1;
                }
            }
        }
    }
}

/// Producer side of the channel
pub struct FrameSender {
    region: ChannelRegion,
    config: ChannelConfig,
    scratch: Vec<u8>,
    last_write_time: u64,
    counters: SenderCounters,
}

impl FrameSender {
    /// Create the channel, or take over an existing one
    ///
    /// The region is sized to exactly fit one frame of the configured
    /// dimensions and gets a fresh header. When taking over, the lock epoch
    /// continues from the previous producer so guards still held against the
    /// old header stay inert.
    pub fn open_or_create(name: &str, config: ChannelConfig) -> Result<Self> {
        checked_payload_len(config.width, config.height)?;
        let size = region_size(config.width, config.height).ok_or(RelayError::InvalidDimensions {
            width: config.width,
            height: config.height,
        })?;

        close_if_larger(name, size);
        let mut shm = RelayShm::create_or_open(name, size)?;
        shm.set_remove_on_drop(config.auto_remove);
        let region = ChannelRegion::new(shm)?;

        let header = region.header();
        let epoch = match header.validate() {
            Ok(true) if !region.created() => header.lock().epoch().wrapping_add(1),
            _ => 0,
        };
        header.initialize(config.width, config.height, epoch);

        if config.lock_policy == LockPolicy::Unlocked {
            tracing::warn!(channel = name, "publishing without locking; readers may see torn frames");
        }
        tracing::info!(
            channel = name,
            width = config.width,
            height = config.height,
            created = region.created(),
            policy = ?config.lock_policy,
            "channel ready"
        );

        Ok(Self {
            region,
            config,
            scratch: Vec::new(),
            last_write_time: 0,
            counters: SenderCounters::default(),
        })
    }

    /// Publish a frame using the configured lock timeout
    ///
    /// `pixels` must hold `width * height * 3` bytes. Frames of other
    /// dimensions than the channel's are rescaled first. Only malformed input
    /// is an error; a frame that could not be written is reported through
    /// the returned status.
    pub fn publish(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        capture_time: u64,
    ) -> Result<PublishStatus> {
        self.publish_with_timeout(pixels, width, height, capture_time, self.config.lock_timeout)
    }

    /// Publish an owned frame, keeping its capture time
    pub fn publish_frame(&mut self, frame: &Frame) -> Result<PublishStatus> {
        self.publish(
            frame.pixels(),
            frame.width(),
            frame.height(),
            frame.capture_time(),
        )
    }

    pub fn publish_with_timeout(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        capture_time: u64,
        timeout: Duration,
    ) -> Result<PublishStatus> {
        let expected = checked_payload_len(width, height)?;
        if pixels.len() != expected {
            return Err(RelayError::FrameSizeMismatch {
                expected,
                got: pixels.len(),
            });
        }

        let (cw, ch) = (self.config.width, self.config.height);
        let mut scratch = std::mem::take(&mut self.scratch);
        let payload = if (width, height) == (cw, ch) {
            pixels
        } else {
            scratch.resize(checked_payload_len(cw, ch)?, 0);
            if let Err(e) = resize_nearest(pixels, width, height, &mut scratch, cw, ch) {
                self.scratch = scratch;
                return Err(e);
            }
            &scratch[..]
        };

        let status = self.write_slot(payload, capture_time, timeout);
        self.scratch = scratch;

        self.counters.record(status);
        if let PublishStatus::Published { write_time } = status {
            self.last_write_time = write_time;
        }
        Ok(status)
    }

    fn write_slot(&self, payload: &[u8], capture_time: u64, timeout: Duration) -> PublishStatus {
        let lock = self.region.header().lock();
        match self.config.lock_policy {
            LockPolicy::TimedExclusive => self.write_timed(payload, capture_time, timeout),
            LockPolicy::TryOnce => match lock.try_lock_exclusive() {
                Some(_guard) => self.commit(payload, capture_time),
                None => PublishStatus::SkippedBusy,
            },
            LockPolicy::YieldToReaders => match lock.lock_exclusive(timeout) {
                Some(_guard) => self.commit(payload, capture_time),
                None => PublishStatus::SkippedBusy,
            },
            LockPolicy::Unlocked => self.commit(payload, capture_time),
        }
    }

    /// Upgradable first, then exclusive, both bounded by one deadline
    fn write_timed(&self, payload: &[u8], capture_time: u64, timeout: Duration) -> PublishStatus {
        let lock = self.region.header().lock();
        let deadline = Instant::now() + timeout;
        let progress_mark = lock.releases();

        let Some(upgradable) = lock.lock_upgradable_until(deadline) else {
            return self.recover(progress_mark, timeout);
        };

        match upgradable.upgrade_until(deadline) {
            Ok(_exclusive) => self.commit(payload, capture_time),
            Err(upgradable) => {
                // Decide before our own release shows up as progress
                let status = self.recover(progress_mark, timeout);
                drop(upgradable);
                status
            }
        }
    }

    /// Rebuild the header if whoever holds the lock is provably stuck
    ///
    /// Stuck means the recorded owner process is gone, or not a single
    /// release happened during the whole wait.
    fn recover(&self, progress_mark: u32, timeout: Duration) -> PublishStatus {
        let header = self.region.header();
        let lock = header.lock();

        let wedged =
            lock.owner_is_dead() || (!timeout.is_zero() && lock.releases() == progress_mark);
        if !wedged {
            tracing::debug!(channel = self.name(), "lock contended past timeout, frame skipped");
            return PublishStatus::SkippedTimeout {
                reconstructed: false,
            };
        }

        let held = lock.snapshot();
        let epoch = header.reconstruct(self.config.width, self.config.height);
        tracing::warn!(
            channel = self.name(),
            readers = held.readers,
            exclusive = held.exclusive,
            upgradable = held.upgradable,
            owner_pid = held.owner_pid,
            epoch,
            "lock wedged past timeout, channel header rebuilt"
        );
        PublishStatus::SkippedTimeout {
            reconstructed: true,
        }
    }

    /// Copy the payload, then the metadata with `write_time` last
    fn commit(&self, payload: &[u8], capture_time: u64) -> PublishStatus {
        let copied = self.region.write_payload(payload);
        debug_assert!(copied, "region sized for the configured frame");

        let write_time = now_nanos().max(self.last_write_time + 1);
        self.region.header().store_record(&FrameRecord {
            width: self.config.width,
            height: self.config.height,
            capture_time,
            write_time,
        });
        PublishStatus::Published { write_time }
    }

    /// Unmap the channel, unlinking it if `auto_remove` is set
    pub fn close(mut self, auto_remove: bool) {
        self.region.set_remove_on_drop(auto_remove);
        self.config.auto_remove = auto_remove;
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn counters(&self) -> SenderCounters {
        self.counters
    }

    /// Write time of the last published frame, 0 if none
    pub fn last_write_time(&self) -> u64 {
        self.last_write_time
    }

    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.region.header().lock().snapshot()
    }

    /// Header contents as they are right now, read without locking
    pub fn header_record(&self) -> FrameRecord {
        self.region.header().record()
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.region.header().set_status(ChannelStatus::Closed);
        tracing::info!(
            channel = self.name(),
            published = self.counters.published,
            skipped = self.counters.skipped_busy + self.counters.skipped_timeout,
            removed = self.config.auto_remove,
            "channel closed"
        );
    }
}

/// Consumer side of the channel
///
/// A receiver can be created before its producer exists; it attaches on the
/// first poll that finds the channel.
pub struct FrameReceiver {
    name: String,
    region: Option<ChannelRegion>,
    attached_at: Instant,
    lock_timeout: Duration,
    last_seen: FrameRecord,
}

impl FrameReceiver {
    /// A receiver that attaches lazily
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            region: None,
            attached_at: Instant::now(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            last_seen: FrameRecord::default(),
        }
    }

    /// Attach right away; fails with `ChannelNotFound` if there is no producer
    pub fn open(name: &str) -> Result<Self> {
        let mut receiver = Self::new(name);
        if !receiver.attach()? {
            return Err(RelayError::ChannelNotFound {
                name: name.to_string(),
            });
        }
        Ok(receiver)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    /// Metadata of the newest frame this receiver has observed
    pub fn last_seen(&self) -> FrameRecord {
        self.last_seen
    }

    fn attach(&mut self) -> Result<bool> {
        let shm = match RelayShm::open(&self.name) {
            Ok(shm) => shm,
            Err(e) if e.is_transient() => return Ok(false),
            Err(e) => return Err(e),
        };
        let region = match ChannelRegion::new(shm) {
            Ok(region) => region,
            // Producer has created the object but not sized it yet
            Err(RelayError::RegionTooSmall { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::debug!(channel = %self.name, size = region.size(), "attached to channel");
        self.region = Some(region);
        self.attached_at = Instant::now();
        Ok(true)
    }

    /// Retry attaching until the channel shows up or `cancel` is set
    ///
    /// Returns `false` if cancelled first.
    pub fn wait_for_channel(&mut self, interval: Duration, cancel: &AtomicBool) -> Result<bool> {
        loop {
            if self.is_attached() || self.attach()? {
                return Ok(true);
            }
            if cancel.load(Ordering::Relaxed) {
                return Ok(false);
            }
            std::thread::sleep(interval);
        }
    }

    /// Header is ready and announces a frame that fits the mapping
    fn usable(region: &ChannelRegion) -> Result<bool> {
        if !region.header().validate()? {
            return Ok(false);
        }
        let (width, height) = region.header().dimensions();
        Ok(region.fits(width, height))
    }

    /// The mapping no longer reflects the live channel
    fn is_stale(region: &ChannelRegion, attached_at: Instant) -> bool {
        let header = region.header();
        let (width, height) = header.dimensions();
        let closed =
            header.status() == ChannelStatus::Closed && attached_at.elapsed() >= REATTACH_INTERVAL;
        closed || !region.fits(width, height)
    }

    /// Make sure a mapping of the current channel is in place
    fn ensure_mapped(&mut self) -> Result<bool> {
        let stale = match &self.region {
            Some(region) if !Self::is_stale(region, self.attached_at) => {
                return Self::usable(region)
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            tracing::debug!(channel = %self.name, "channel was closed or resized, remapping");
            self.region = None;
        }

        if !self.attach()? {
            return Ok(false);
        }
        match &self.region {
            Some(region) => Self::usable(region),
            None => Ok(false),
        }
    }

    /// Check for a frame newer than the last one observed
    ///
    /// Returns `Ok(false)` when the channel does not exist yet, holds no
    /// frame, or the lock could not be shared in time. Errors only for an
    /// incompatible or unmappable region.
    pub fn poll(&mut self) -> Result<bool> {
        if !self.ensure_mapped()? {
            return Ok(false);
        }
        let Some(region) = self.region.as_ref() else {
            return Ok(false);
        };

        let header = region.header();
        let Some(guard) = header.lock().lock_shared(self.lock_timeout) else {
            return Ok(false);
        };
        let record = header.record();
        drop(guard);

        if !record.is_primed()
            || record.write_time <= self.last_seen.write_time
            || !region.fits(record.width, record.height)
        {
            return Ok(false);
        }

        self.last_seen = record;
        Ok(true)
    }

    /// Copy the current frame out of the channel
    ///
    /// The copy belongs to the caller and stays valid after the lock is
    /// released. Returns `None` if there is no frame, the lock is busy, or
    /// the header was rebuilt while copying.
    pub fn copy_frame(&mut self) -> Result<Option<Frame>> {
        let Some(region) = self.region.as_ref() else {
            return Ok(None);
        };
        if !region.header().validate()? {
            return Ok(None);
        }

        let header = region.header();
        let Some(guard) = header.lock().lock_shared(self.lock_timeout) else {
            return Ok(None);
        };
        let record = header.record();
        let Some(len) = record
            .payload_len()
            .filter(|_| record.is_primed() && region.fits(record.width, record.height))
        else {
            return Ok(None);
        };

        let mut pixels = vec![0u8; len];
        region.read_payload(&mut pixels);
        if !guard.release() {
            tracing::debug!(channel = %self.name, "header rebuilt during copy, discarding frame");
            return Ok(None);
        }

        if record.write_time > self.last_seen.write_time {
            self.last_seen = record;
        }
        Ok(Some(Frame::from_record(&record, pixels)))
    }

    /// Borrow the current frame in place while holding a shared lock
    ///
    /// The producer cannot overwrite the slot until the view is dropped, so
    /// keep it short-lived.
    pub fn view(&self) -> Option<FrameView<'_>> {
        let region = self.region.as_ref()?;
        if !matches!(region.header().validate(), Ok(true)) {
            return None;
        }

        let header = region.header();
        let guard = header.lock().lock_shared(self.lock_timeout)?;
        let record = header.record();
        if !record.is_primed() {
            return None;
        }
        let len = record.payload_len()?;
        // SAFETY: `guard` keeps writers out for the lifetime of the view
        let pixels = unsafe { region.payload(len)? };

        Some(FrameView {
            guard,
            record,
            pixels,
        })
    }

    /// Poll and copy in one step
    pub fn recv(&mut self) -> Result<Option<Frame>> {
        if self.poll()? {
            self.copy_frame()
        } else {
            Ok(None)
        }
    }
}

/// Zero-copy view of the channel's frame, valid while the shared lock is held
pub struct FrameView<'a> {
    guard: SharedGuard<'a>,
    record: FrameRecord,
    pixels: &'a [u8],
}

impl FrameView<'_> {
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        self.pixels
    }

    #[inline]
    pub fn record(&self) -> FrameRecord {
        self.record
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.record.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.record.height
    }

    /// `false` once the producer has rebuilt the header underneath this view;
    /// the pixels may then be overwritten at any time
    pub fn is_current(&self) -> bool {
        self.guard.is_current()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::from_record(&self.record, self.pixels.to_vec())
    }

    /// Give the lock back; returns whether the view stayed valid throughout
    pub fn release(self) -> bool {
        self.guard.release()
    }
}

/// Mark a kept region that is too large for the new producer as closed
///
/// The region is replaced rather than shrunk, so its consumers keep a valid
/// mapping and move over once they see the status.
fn close_if_larger(name: &str, size: usize) {
    let Ok(old) = RelayShm::open(name) else {
        return;
    };
    if old.size() <= size {
        return;
    }
    if let Ok(region) = ChannelRegion::new(old) {
        if matches!(region.header().validate(), Ok(true)) {
            region.header().set_status(ChannelStatus::Closed);
        }
    }
}

/// Unlink a channel by name, e.g. one left behind with `auto_remove` off
///
/// Returns `false` if no such channel existed.
pub fn remove_channel(name: &str) -> Result<bool> {
    RelayShm::remove(name)
}

/// Snapshot of a channel for diagnostics
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub size: usize,
    pub ready: bool,
    pub status: ChannelStatus,
    pub producer_pid: u32,
    pub record: FrameRecord,
    pub lock: LockSnapshot,
}

/// Read a channel's header without taking its lock
pub fn inspect_channel(name: &str) -> Result<ChannelInfo> {
    let region = ChannelRegion::new(RelayShm::open(name)?)?;
    let header = region.header();
    Ok(ChannelInfo {
        name: name.to_string(),
        size: region.size(),
        ready: header.validate()?,
        status: header.status(),
        producer_pid: header.producer_pid(),
        record: header.record(),
        lock: header.lock().snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::NEVER_WRITTEN;
    use crate::shm::tests::unique_name;
    use std::sync::Arc;
    use std::thread;

    fn solid(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; width as usize * height as usize * 3]
    }

    fn sender(tag: &str, width: u32, height: u32) -> FrameSender {
        FrameSender::open_or_create(&unique_name(tag), ChannelConfig::new(width, height)).unwrap()
    }

    #[test]
    fn test_unprimed_channel_has_nothing() {
        let tx = sender("ch_unprimed", 4, 4);
        let mut rx = FrameReceiver::open(tx.name()).unwrap();
        assert!(!rx.poll().unwrap());
        assert!(rx.copy_frame().unwrap().is_none());
        assert!(rx.view().is_none());
    }

    #[test]
    fn test_copy_round_trip() {
        let mut tx = sender("ch_roundtrip", 4, 3);
        let mut rx = FrameReceiver::open(tx.name()).unwrap();

        let pixels: Vec<u8> = (0..4 * 3 * 3).map(|i| i as u8).collect();
        let status = tx.publish(&pixels, 4, 3, 1234).unwrap();
        assert!(status.is_published());

        assert!(rx.poll().unwrap());
        let frame = rx.copy_frame().unwrap().unwrap();
        assert_eq!(frame.pixels(), &pixels[..]);
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.capture_time(), 1234);
        assert_eq!(Some(frame.write_time()), match status {
            PublishStatus::Published { write_time } => Some(write_time),
            _ => None,
        });
    }

    #[test]
    fn test_fresh_exactly_once_per_write() {
        let mut tx = sender("ch_fresh", 2, 2);
        let mut rx = FrameReceiver::open(tx.name()).unwrap();

        let mut last = 0;
        for i in 0..5u8 {
            tx.publish(&solid(2, 2, i), 2, 2, i as u64).unwrap();
            assert!(rx.poll().unwrap());
            assert!(rx.last_seen().write_time > last);
            last = rx.last_seen().write_time;
            assert_eq!(rx.copy_frame().unwrap().unwrap().pixels(), &solid(2, 2, i)[..]);

            assert!(!rx.poll().unwrap());
            assert!(!rx.poll().unwrap());
        }
    }

    #[test]
    fn test_write_times_strictly_increase() {
        let mut tx = sender("ch_monotonic", 1, 1);
        let mut prev = 0;
        for _ in 0..100 {
            match tx.publish(&[1, 2, 3], 1, 1, 0).unwrap() {
                PublishStatus::Published { write_time } => {
                    assert!(write_time > prev);
                    prev = write_time;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(tx.counters().published, 100);
    }

    #[test]
    fn test_receivers_track_staleness_independently() {
        let mut tx = sender("ch_independent", 2, 1);
        let mut a = FrameReceiver::open(tx.name()).unwrap();
        let mut b = FrameReceiver::open(tx.name()).unwrap();

        tx.publish(&solid(2, 1, 9), 2, 1, 0).unwrap();
        assert!(a.poll().unwrap());
        assert!(!a.poll().unwrap());
        assert!(b.poll().unwrap());
        assert!(!b.poll().unwrap());
    }

    #[test]
    fn test_mismatched_frame_is_rescaled() {
        let mut tx = sender("ch_rescale", 4, 4);
        let mut rx = FrameReceiver::open(tx.name()).unwrap();

        assert!(tx.publish(&solid(8, 6, 77), 8, 6, 0).unwrap().is_published());
        let frame = rx.recv().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 4));
        assert_eq!(frame.pixels(), &solid(4, 4, 77)[..]);

        // Smaller input is scaled up, still exactly the channel size
        assert!(tx.publish(&solid(1, 1, 5), 1, 1, 0).unwrap().is_published());
        let frame = rx.recv().unwrap().unwrap();
        assert_eq!(frame.pixels().len(), 4 * 4 * 3);
        assert_eq!(frame.pixels(), &solid(4, 4, 5)[..]);
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        let mut tx = sender("ch_malformed", 2, 2);
        assert!(matches!(
            tx.publish(&[0; 5], 2, 2, 0),
            Err(RelayError::FrameSizeMismatch { expected: 12, got: 5 })
        ));
        assert!(matches!(
            tx.publish(&[], 0, 2, 0),
            Err(RelayError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            FrameSender::open_or_create(&unique_name("ch_zero"), ChannelConfig::new(0, 1)),
            Err(RelayError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_share_mode_view() {
        let mut tx = sender("ch_view", 3, 1);
        let mut rx = FrameReceiver::open(tx.name()).unwrap();
        tx.publish(&solid(3, 1, 42), 3, 1, 0).unwrap();

        assert!(rx.poll().unwrap());
        let view = rx.view().unwrap();
        assert_eq!(view.pixels(), &solid(3, 1, 42)[..]);
        assert_eq!((view.width(), view.height()), (3, 1));
        assert_eq!(tx.lock_snapshot().readers, 1);

        // The writer is held off while the view is alive
        let status = tx
            .publish_with_timeout(&solid(3, 1, 1), 3, 1, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(status, PublishStatus::SkippedTimeout { reconstructed: false });
        assert_eq!(view.pixels(), &solid(3, 1, 42)[..]);

        assert!(view.release());
        assert_eq!(tx.lock_snapshot().readers, 0);
        assert!(tx.publish(&solid(3, 1, 1), 3, 1, 0).unwrap().is_published());
    }

    #[test]
    fn test_wedged_reader_is_recovered() {
        let name = unique_name("ch_wedged_reader");
        let config = ChannelConfig::new(2, 2).with_lock_timeout(Duration::from_millis(30));
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();
        let mut rx = FrameReceiver::open(&name).unwrap();

        tx.publish(&solid(2, 2, 1), 2, 2, 0).unwrap();
        assert!(rx.poll().unwrap());
        let stuck = rx.view().unwrap();

        let status = tx.publish(&solid(2, 2, 2), 2, 2, 0).unwrap();
        assert_eq!(status, PublishStatus::SkippedTimeout { reconstructed: true });
        assert!(!stuck.is_current());

        let record = tx.header_record();
        assert_eq!((record.width, record.height), (2, 2));
        assert_eq!(record.write_time, NEVER_WRITTEN);
        assert!(tx.lock_snapshot().is_free());

        // The late release must not disturb the rebuilt lock
        assert!(!stuck.release());
        assert!(tx.lock_snapshot().is_free());

        assert!(tx.publish(&solid(2, 2, 3), 2, 2, 0).unwrap().is_published());
        let frame = rx.recv().unwrap().unwrap();
        assert_eq!(frame.pixels(), &solid(2, 2, 3)[..]);
        assert_eq!(tx.counters().reconstructions, 1);
    }

    #[test]
    fn test_wedged_writer_is_recovered() {
        let name = unique_name("ch_wedged_writer");
        let config = ChannelConfig::new(2, 1).with_lock_timeout(Duration::from_millis(20));
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();

        // Simulate a holder that took the lock and never came back
        let rx = FrameReceiver::open(&name).unwrap();
        let region = rx.region.as_ref().unwrap();
        std::mem::forget(region.header().lock().try_lock_exclusive().unwrap());

        let started = Instant::now();
        let status = tx.publish(&solid(2, 1, 8), 2, 1, 0).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(status, PublishStatus::SkippedTimeout { reconstructed: true });

        let record = tx.header_record();
        assert_eq!((record.width, record.height), (2, 1));
        assert_eq!(record.write_time, NEVER_WRITTEN);
        assert!(tx.publish(&solid(2, 1, 8), 2, 1, 0).unwrap().is_published());
    }

    #[test]
    fn test_dead_owner_rebuilds_without_waiting() {
        use crate::rwlock::tests::{hand_to, reaped_pid};

        let name = unique_name("ch_dead_owner");
        let config = ChannelConfig::new(1, 1).with_lock_timeout(Duration::ZERO);
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();

        let rx = FrameReceiver::open(&name).unwrap();
        let lock = rx.region.as_ref().unwrap().header().lock();
        std::mem::forget(lock.try_lock_exclusive().unwrap());

        // Holder alive and no wait window: nothing proves it is stuck
        let status = tx.publish(&[1, 1, 1], 1, 1, 0).unwrap();
        assert_eq!(status, PublishStatus::SkippedTimeout { reconstructed: false });

        hand_to(lock, reaped_pid());
        let status = tx.publish(&[2, 2, 2], 1, 1, 0).unwrap();
        assert_eq!(status, PublishStatus::SkippedTimeout { reconstructed: true });
        assert!(tx.lock_snapshot().is_free());

        assert!(tx.publish(&[3, 3, 3], 1, 1, 0).unwrap().is_published());
        assert_eq!(tx.counters().reconstructions, 1);
    }

    #[test]
    fn test_try_once_skips_when_busy() {
        let name = unique_name("ch_try_once");
        let config = ChannelConfig::new(1, 1).with_lock_policy(LockPolicy::TryOnce);
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();
        let mut rx = FrameReceiver::open(&name).unwrap();

        tx.publish(&[1, 1, 1], 1, 1, 0).unwrap();
        assert!(rx.poll().unwrap());
        let view = rx.view().unwrap();
        assert_eq!(tx.publish(&[2, 2, 2], 1, 1, 0).unwrap(), PublishStatus::SkippedBusy);
        drop(view);
        assert!(tx.publish(&[2, 2, 2], 1, 1, 0).unwrap().is_published());
        assert_eq!(tx.counters().skipped_busy, 1);
    }

    #[test]
    fn test_yield_to_readers_never_rebuilds() {
        let name = unique_name("ch_yield");
        let config = ChannelConfig::new(1, 1)
            .with_lock_policy(LockPolicy::YieldToReaders)
            .with_lock_timeout(Duration::from_millis(20));
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();
        let mut rx = FrameReceiver::open(&name).unwrap();

        tx.publish(&[1, 1, 1], 1, 1, 0).unwrap();
        let before = tx.header_record();
        assert!(rx.poll().unwrap());
        let view = rx.view().unwrap();

        assert_eq!(tx.publish(&[2, 2, 2], 1, 1, 0).unwrap(), PublishStatus::SkippedBusy);
        assert_eq!(tx.header_record(), before);
        assert!(view.is_current());
        drop(view);
        assert!(tx.publish(&[2, 2, 2], 1, 1, 0).unwrap().is_published());
    }

    #[test]
    fn test_unlocked_ignores_readers() {
        let name = unique_name("ch_unlocked");
        let config = ChannelConfig::new(1, 1).with_lock_policy(LockPolicy::Unlocked);
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();
        let mut rx = FrameReceiver::open(&name).unwrap();

        tx.publish(&[1, 1, 1], 1, 1, 0).unwrap();
        assert!(rx.poll().unwrap());
        let view = rx.view().unwrap();
        assert!(tx.publish(&[2, 2, 2], 1, 1, 0).unwrap().is_published());
        drop(view);
        assert_eq!(rx.recv().unwrap().unwrap().pixels(), &[2, 2, 2]);
    }

    #[test]
    fn test_receiver_before_producer() {
        let name = unique_name("ch_early");
        let mut rx = FrameReceiver::new(&name);
        assert!(!rx.poll().unwrap());
        assert!(!rx.is_attached());
        assert!(matches!(
            FrameReceiver::open(&name),
            Err(RelayError::ChannelNotFound { .. })
        ));

        let cancel = AtomicBool::new(true);
        assert!(!rx.wait_for_channel(Duration::from_millis(1), &cancel).unwrap());

        let mut tx = FrameSender::open_or_create(&name, ChannelConfig::new(2, 2)).unwrap();
        assert!(!rx.poll().unwrap());
        assert!(rx.is_attached());
        tx.publish(&solid(2, 2, 3), 2, 2, 0).unwrap();
        assert!(rx.poll().unwrap());
    }

    #[test]
    fn test_wait_for_channel_attaches() {
        let name = unique_name("ch_wait");
        let waiter = {
            let name = name.clone();
            thread::spawn(move || {
                let mut rx = FrameReceiver::new(&name);
                let cancel = AtomicBool::new(false);
                rx.wait_for_channel(Duration::from_millis(5), &cancel).unwrap()
            })
        };
        thread::sleep(Duration::from_millis(20));
        let _tx = FrameSender::open_or_create(&name, ChannelConfig::new(1, 1)).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_auto_remove_on_drop() {
        let tx = sender("ch_autoremove", 2, 2);
        let name = tx.name().to_string();
        drop(tx);
        assert!(matches!(
            FrameReceiver::open(&name),
            Err(RelayError::ChannelNotFound { .. })
        ));
    }

    #[test]
    fn test_keep_allows_reattach() {
        let name = unique_name("ch_keep");
        let config = ChannelConfig::new(2, 2).with_auto_remove(false);

        let mut first = FrameSender::open_or_create(&name, config.clone()).unwrap();
        first.publish(&solid(2, 2, 1), 2, 2, 0).unwrap();
        let first_epoch = first.lock_snapshot().epoch;
        drop(first);

        let info = inspect_channel(&name).unwrap();
        assert_eq!(info.status, ChannelStatus::Closed);
        assert!(info.record.is_primed());

        let mut rx = FrameReceiver::open(&name).unwrap();
        let second = FrameSender::open_or_create(&name, config).unwrap();
        assert_eq!(second.lock_snapshot().epoch, first_epoch.wrapping_add(1));
        assert_eq!(second.header_record().write_time, NEVER_WRITTEN);
        assert!(!rx.poll().unwrap());

        second.close(true);
        assert!(!remove_channel(&name).unwrap());
    }

    #[test]
    fn test_receiver_follows_restarted_producer() {
        let name = unique_name("ch_restart");
        let mut rx = FrameReceiver::new(&name);

        let mut first = FrameSender::open_or_create(&name, ChannelConfig::new(2, 2)).unwrap();
        first.publish(&solid(2, 2, 1), 2, 2, 0).unwrap();
        assert!(rx.poll().unwrap());
        drop(first);

        // New region under the same name, and larger
        let mut second = FrameSender::open_or_create(&name, ChannelConfig::new(4, 4)).unwrap();
        second.publish(&solid(4, 4, 2), 4, 4, 0).unwrap();

        thread::sleep(REATTACH_INTERVAL + Duration::from_millis(50));
        assert!(rx.poll().unwrap());
        let frame = rx.copy_frame().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 4));
        assert_eq!(frame.pixels(), &solid(4, 4, 2)[..]);
    }

    #[test]
    fn test_smaller_takeover_keeps_views_valid() {
        let name = unique_name("ch_shrink");
        let mut first =
            FrameSender::open_or_create(&name, ChannelConfig::new(64, 64).with_auto_remove(false))
                .unwrap();
        first.publish(&solid(64, 64, 3), 64, 64, 0).unwrap();

        let mut rx = FrameReceiver::open(&name).unwrap();
        assert!(rx.poll().unwrap());
        let view = rx.view().unwrap();
        drop(first);

        let mut second = FrameSender::open_or_create(&name, ChannelConfig::new(1, 1)).unwrap();
        assert_eq!(second.lock_snapshot().epoch, 0);

        // The old region is left intact for the view holder
        assert!(view.is_current());
        assert_eq!(view.pixels().len(), 64 * 64 * 3);
        assert!(view.pixels().iter().all(|&b| b == 3));
        assert!(view.release());

        assert!(second.publish(&solid(1, 1, 9), 1, 1, 0).unwrap().is_published());
        thread::sleep(REATTACH_INTERVAL + Duration::from_millis(50));
        let frame = rx.recv().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (1, 1));
        assert_eq!(frame.pixels(), &[9, 9, 9]);
    }

    #[test]
    fn test_concurrent_readers_agree() {
        let mut tx = sender("ch_readers", 16, 16);
        let pixels: Vec<u8> = (0..16 * 16 * 3).map(|i| (i * 7) as u8).collect();
        tx.publish(&pixels, 16, 16, 0).unwrap();

        let name = tx.name().to_string();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                thread::spawn(move || {
                    let mut rx = FrameReceiver::open(&name).unwrap();
                    assert!(rx.poll().unwrap());
                    (0..50)
                        .map(|_| rx.copy_frame().unwrap().unwrap().into_pixels())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for reader in readers {
            for copy in reader.join().unwrap() {
                assert_eq!(copy, pixels);
            }
        }
    }

    #[test]
    fn test_no_torn_frames_under_contention() {
        let (w, h) = (64, 48);
        let name = unique_name("ch_torn");
        let config = ChannelConfig::new(w, h).with_lock_timeout(Duration::from_secs(2));
        let mut tx = FrameSender::open_or_create(&name, config).unwrap();
        tx.publish(&solid(w, h, 0), w, h, 0).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let name = name.clone();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut rx = FrameReceiver::open(&name)
                        .unwrap()
                        .with_lock_timeout(Duration::from_secs(2));
                    let mut checked = 0;
                    while !done.load(Ordering::Relaxed) || checked < 10 {
                        if let Some(frame) = rx.copy_frame().unwrap() {
                            let first = frame.pixels()[0];
                            assert!(first == 0 || first == 255);
                            assert!(frame.pixels().iter().all(|&b| b == first), "torn frame");
                            checked += 1;
                        }
                    }
                    checked
                })
            })
            .collect();

        let zeros = solid(w, h, 0);
        let ones = solid(w, h, 255);
        for i in 0..500 {
            let pixels = if i % 2 == 0 { &ones } else { &zeros };
            tx.publish(pixels, w, h, i).unwrap();
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(tx.counters().reconstructions, 0);
    }
}
