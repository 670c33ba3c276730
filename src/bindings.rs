//! C Bindings for the frame relay
//!
//! Provides a raw C API over [`FrameSender`] and [`FrameReceiver`] so that
//! producers and consumers written in other languages can share a channel.

use crate::channel::{ChannelConfig, FrameReceiver, FrameSender, LockPolicy, PublishStatus};
use crate::frame::Frame;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::time::Duration;

// Opaque handles
pub struct RelaySenderHandle(FrameSender);
pub struct RelayReceiverHandle(FrameReceiver);

pub const RELAY_PUBLISHED: i32 = 0;
pub const RELAY_SKIPPED_TIMEOUT: i32 = 1;
pub const RELAY_SKIPPED_RECONSTRUCTED: i32 = 2;
pub const RELAY_SKIPPED_BUSY: i32 = 3;
pub const RELAY_ERROR: i32 = -1;
pub const RELAY_BUFFER_TOO_SMALL: i64 = -2;

#[repr(C)]
pub struct RelaySenderConfig {
    pub width: u32,
    pub height: u32,
    pub lock_timeout_ms: u64,
    pub auto_remove: bool,
    /// 0 = timed exclusive, 1 = try once, 2 = yield to readers, 3 = unlocked
    pub lock_policy: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct RelayFrameInfo {
    pub width: u32,
    pub height: u32,
    pub capture_time: u64,
    pub write_time: u64,
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

fn policy_from_raw(raw: u32) -> Option<LockPolicy> {
    match raw {
        0 => Some(LockPolicy::TimedExclusive),
        1 => Some(LockPolicy::TryOnce),
        2 => Some(LockPolicy::YieldToReaders),
        3 => Some(LockPolicy::Unlocked),
        _ => None,
    }
}

fn fill_info(out: *mut RelayFrameInfo, frame: &Frame) {
    if out.is_null() {
        return;
    }
    // SAFETY: caller passes either null or a valid RelayFrameInfo
    unsafe {
        *out = RelayFrameInfo {
            width: frame.width(),
            height: frame.height(),
            capture_time: frame.capture_time(),
            write_time: frame.write_time(),
        };
    }
}

/// Create or take over a channel as its producer
///
/// Returns null on failure.
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn relay_sender_create(
    name: *const c_char,
    config: RelaySenderConfig,
) -> *mut RelaySenderHandle {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    let Some(policy) = policy_from_raw(config.lock_policy) else {
        return ptr::null_mut();
    };

    let rust_config = ChannelConfig::new(config.width, config.height)
        .with_lock_timeout(Duration::from_millis(config.lock_timeout_ms))
        .with_auto_remove(config.auto_remove)
        .with_lock_policy(policy);

    match FrameSender::open_or_create(name, rust_config) {
        Ok(sender) => Box::into_raw(Box::new(RelaySenderHandle(sender))),
        Err(e) => {
            tracing::error!(channel = name, error = %e, "relay_sender_create failed");
            ptr::null_mut()
        }
    }
}

/// Publish `len` bytes of a `width` x `height` 24-bit frame
///
/// Returns one of the `RELAY_PUBLISHED` / `RELAY_SKIPPED_*` codes, or
/// `RELAY_ERROR` for bad arguments.
///
/// # Safety
/// handle must come from `relay_sender_create`; pixels must point to `len`
/// readable bytes
#[no_mangle]
pub unsafe extern "C" fn relay_sender_publish(
    handle: *mut RelaySenderHandle,
    pixels: *const u8,
    len: usize,
    width: u32,
    height: u32,
    capture_time: u64,
) -> i32 {
    if handle.is_null() || pixels.is_null() {
        return RELAY_ERROR;
    }
    let sender = &mut (*handle).0;
    let pixels = slice::from_raw_parts(pixels, len);

    match sender.publish(pixels, width, height, capture_time) {
        Ok(PublishStatus::Published { .. }) => RELAY_PUBLISHED,
        Ok(PublishStatus::SkippedTimeout { reconstructed: false }) => RELAY_SKIPPED_TIMEOUT,
        Ok(PublishStatus::SkippedTimeout { reconstructed: true }) => RELAY_SKIPPED_RECONSTRUCTED,
        Ok(PublishStatus::SkippedBusy) => RELAY_SKIPPED_BUSY,
        Err(_) => RELAY_ERROR,
    }
}

/// Destroy a sender handle, removing the channel if configured to
#[no_mangle]
pub unsafe extern "C" fn relay_sender_destroy(handle: *mut RelaySenderHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Create a receiver; it attaches once the channel exists
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn relay_receiver_create(name: *const c_char) -> *mut RelayReceiverHandle {
    match name_arg(name) {
        Some(name) => Box::into_raw(Box::new(RelayReceiverHandle(FrameReceiver::new(name)))),
        None => ptr::null_mut(),
    }
}

/// Returns 1 if a newer frame is available, 0 if not, `RELAY_ERROR` on error
#[no_mangle]
pub unsafe extern "C" fn relay_receiver_poll(handle: *mut RelayReceiverHandle) -> i32 {
    if handle.is_null() {
        return RELAY_ERROR;
    }
    match (*handle).0.poll() {
        Ok(fresh) => fresh as i32,
        Err(_) => RELAY_ERROR,
    }
}

/// Copy the current frame into `buf`
///
/// Returns the number of bytes written, 0 if there is no frame,
/// `RELAY_BUFFER_TOO_SMALL` (with `out_info` filled in so the caller can
/// size its buffer) or `RELAY_ERROR`.
///
/// # Safety
/// handle must come from `relay_receiver_create`; buf must point to
/// `buf_len` writable bytes; out_info may be null
#[no_mangle]
pub unsafe extern "C" fn relay_receiver_copy(
    handle: *mut RelayReceiverHandle,
    buf: *mut u8,
    buf_len: usize,
    out_info: *mut RelayFrameInfo,
) -> i64 {
    if handle.is_null() || buf.is_null() {
        return RELAY_ERROR as i64;
    }

    let frame = match (*handle).0.copy_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => return 0,
        Err(_) => return RELAY_ERROR as i64,
    };
    fill_info(out_info, &frame);

    let pixels = frame.pixels();
    if pixels.len() > buf_len {
        return RELAY_BUFFER_TOO_SMALL;
    }
    let out = slice::from_raw_parts_mut(buf, pixels.len());
    out.copy_from_slice(pixels);
    pixels.len() as i64
}

/// Destroy a receiver handle
#[no_mangle]
pub unsafe extern "C" fn relay_receiver_destroy(handle: *mut RelayReceiverHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Unlink a channel left behind by a producer; 1 if removed, 0 if absent
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn relay_channel_remove(name: *const c_char) -> i32 {
    let Some(name) = name_arg(name) else {
        return RELAY_ERROR;
    };
    match crate::channel::remove_channel(name) {
        Ok(removed) => removed as i32,
        Err(_) => RELAY_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::unique_name;
    use std::ffi::CString;

    #[test]
    fn test_c_round_trip() {
        let name = CString::new(unique_name("ffi")).unwrap();
        let config = RelaySenderConfig {
            width: 2,
            height: 2,
            lock_timeout_ms: 100,
            auto_remove: true,
            lock_policy: 0,
        };

        unsafe {
            let rx = relay_receiver_create(name.as_ptr());
            assert!(!rx.is_null());
            assert_eq!(relay_receiver_poll(rx), 0);

            let tx = relay_sender_create(name.as_ptr(), config);
            assert!(!tx.is_null());

            let pixels = [7u8; 12];
            assert_eq!(
                relay_sender_publish(tx, pixels.as_ptr(), pixels.len(), 2, 2, 55),
                RELAY_PUBLISHED
            );
            assert_eq!(
                relay_sender_publish(tx, pixels.as_ptr(), 3, 2, 2, 55),
                RELAY_ERROR
            );

            assert_eq!(relay_receiver_poll(rx), 1);
            let mut info = RelayFrameInfo::default();
            let mut small = [0u8; 4];
            assert_eq!(
                relay_receiver_copy(rx, small.as_mut_ptr(), small.len(), &mut info),
                RELAY_BUFFER_TOO_SMALL
            );
            assert_eq!((info.width, info.height), (2, 2));

            let mut buf = [0u8; 12];
            assert_eq!(relay_receiver_copy(rx, buf.as_mut_ptr(), buf.len(), &mut info), 12);
            assert_eq!(buf, pixels);
            assert_eq!(info.capture_time, 55);

            relay_receiver_destroy(rx);
            relay_sender_destroy(tx);
            assert_eq!(relay_channel_remove(name.as_ptr()), 0);
        }
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let config = RelaySenderConfig {
            width: 1,
            height: 1,
            lock_timeout_ms: 10,
            auto_remove: true,
            lock_policy: 9,
        };
        let name = CString::new(unique_name("ffi_bad")).unwrap();
        unsafe {
            assert!(relay_sender_create(ptr::null(), RelaySenderConfig { lock_policy: 0, ..config }).is_null());
            assert!(relay_sender_create(name.as_ptr(), config).is_null());
            assert!(relay_receiver_create(ptr::null()).is_null());
            assert_eq!(relay_receiver_poll(ptr::null_mut()), RELAY_ERROR);
        }
    }
}
