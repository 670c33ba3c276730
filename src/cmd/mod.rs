use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shm_frame_relay::LockPolicy;

use crate::exit::{CliError, CliResult, INTERNAL};

pub mod inspect;
pub mod recv;
pub mod send;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish frames into a channel.
    Send(SendArgs),
    /// Receive frames and report rate and latency.
    Recv(RecvArgs),
    /// Print a channel's header and lock state.
    Inspect(ChannelArgs),
    /// Unlink a channel left behind by a producer.
    Remove(ChannelArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args),
        Command::Recv(args) => recv::run(args),
        Command::Inspect(args) => inspect::run_inspect(args),
        Command::Remove(args) => inspect::run_remove(args),
    }
}

#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Channel name shared by producer and consumers.
    #[arg(long, short = 'n', env = "FRAME_RELAY_CHANNEL")]
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Wait up to the timeout, rebuild the header if the lock is wedged.
    Timed,
    /// Single attempt; drop the frame when busy.
    TryOnce,
    /// Let readers finish up to the timeout, then drop the frame.
    Yield,
    /// No locking. Readers may see torn frames.
    Unlocked,
}

impl From<PolicyArg> for LockPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Timed => LockPolicy::TimedExclusive,
            PolicyArg::TryOnce => LockPolicy::TryOnce,
            PolicyArg::Yield => LockPolicy::YieldToReaders,
            PolicyArg::Unlocked => LockPolicy::Unlocked,
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Channel frame width; frames of other sizes are rescaled.
    #[arg(long, default_value = "640")]
    pub width: u32,
    /// Channel frame height.
    #[arg(long, default_value = "480")]
    pub height: u32,
    /// Raw RGB24 file to play in a loop instead of the test pattern.
    #[arg(long, value_name = "FILE", requires_all = ["source_width", "source_height"])]
    pub input: Option<PathBuf>,
    /// Width of the frames in --input (or of the test pattern).
    #[arg(long)]
    pub source_width: Option<u32>,
    /// Height of the frames in --input (or of the test pattern).
    #[arg(long)]
    pub source_height: Option<u32>,
    /// Frames per second; 0 publishes as fast as possible.
    #[arg(long, default_value = "30")]
    pub fps: f64,
    /// Stop after N publish attempts.
    #[arg(long)]
    pub count: Option<u64>,
    /// Lock timeout in milliseconds.
    #[arg(long, default_value = "100")]
    pub timeout_ms: u64,
    /// Lock acquisition policy.
    #[arg(long, value_enum, default_value = "timed")]
    pub policy: PolicyArg,
    /// Leave the channel in place on exit so a new producer can take over.
    #[arg(long)]
    pub keep: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReadMode {
    /// Copy each frame out and release the lock right away.
    Copy,
    /// Read frames in place while holding the shared lock.
    Share,
}

#[derive(Args, Debug)]
pub struct RecvArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// How frames are read from the channel.
    #[arg(long, value_enum, default_value = "copy")]
    pub mode: ReadMode,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<u64>,
    /// Write the last received frame to this file as PPM on exit.
    #[arg(long, value_name = "FILE")]
    pub snapshot: Option<PathBuf>,
    /// Delay between attempts to open a channel that does not exist yet.
    #[arg(long, default_value = "100")]
    pub retry_ms: u64,
    /// Delay between polls when no new frame is available.
    #[arg(long, default_value = "500")]
    pub poll_us: u64,
    /// Lock timeout in milliseconds.
    #[arg(long, default_value = "100")]
    pub timeout_ms: u64,
}

/// Cancellation token set on SIGINT/SIGTERM
pub fn install_cancel_handler() -> CliResult<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    Ok(cancel)
}
