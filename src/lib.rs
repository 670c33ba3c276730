//! Single-slot shared memory frame relay
//!
//! One producer publishes the most recent video frame into a named shared
//! memory region; any number of consumer processes pick up the latest frame
//! without the producer ever waiting on them for long.
//!
//! # Architecture
//!
//! - **Producer** ([`FrameSender`]): owns the region, rescales and copies
//!   frames into it under an exclusive lock, stamps `write_time` last
//! - **Consumers** ([`FrameReceiver`]): poll `write_time` under a shared lock
//!   and copy the frame out, or borrow it in place through a [`FrameView`]
//!
//! A producer that cannot get the lock within its timeout because the holder
//! is wedged rebuilds the header in place and skips that one frame. Lock
//! epochs make sure the written-off holder cannot disturb the rebuilt lock.

pub mod error;
pub mod shm;
pub mod rwlock;
pub mod header;
pub mod frame;
pub mod channel;
pub mod stats;
pub mod bindings;

pub use error::{RelayError, Result};
pub use channel::{
    inspect_channel, remove_channel, ChannelConfig, ChannelInfo, FrameReceiver, FrameSender,
    FrameView, LockPolicy, PublishStatus, SenderCounters, DEFAULT_LOCK_TIMEOUT,
};
pub use frame::{now_nanos, Frame};
pub use header::{ChannelStatus, FrameRecord};
pub use stats::{FrameStats, StatsReport};
