use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use shm_frame_relay::{
    now_nanos, ChannelConfig, Frame, FrameSender, PublishStatus, SenderCounters,
};

use crate::cmd::{install_cancel_handler, SendArgs};
use crate::exit::{io_error, relay_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};

/// Where outgoing frames come from
enum FrameSource {
    /// Moving gradient, regenerated for every frame
    Pattern { frame: Frame, tick: u64 },
    /// Raw RGB24 frames back to back, replayed from the start at the end
    Raw {
        data: Vec<u8>,
        width: u32,
        height: u32,
        frame_len: usize,
        position: usize,
    },
}

impl FrameSource {
    fn pattern(width: u32, height: u32) -> CliResult<Self> {
        let frame = Frame::new(width, height).map_err(|e| relay_error("bad source size", e))?;
        Ok(FrameSource::Pattern { frame, tick: 0 })
    }

    fn raw(path: &Path, width: u32, height: u32) -> CliResult<Self> {
        let frame_len = Frame::new(width, height)
            .map_err(|e| relay_error("bad source size", e))?
            .pixels()
            .len();
        let data = std::fs::read(path)
            .map_err(|e| io_error(&format!("cannot read {}", path.display()), e))?;

        if data.is_empty() || data.len() % frame_len != 0 {
            return Err(CliError::new(
                DATA_INVALID,
                format!(
                    "{} holds {} bytes, not a whole number of {}x{} frames",
                    path.display(),
                    data.len(),
                    width,
                    height
                ),
            ));
        }
        tracing::info!(
            file = %path.display(),
            frames = data.len() / frame_len,
            "playing raw input"
        );

        Ok(FrameSource::Raw {
            data,
            width,
            height,
            frame_len,
            position: 0,
        })
    }

    /// Next frame as (pixels, width, height)
    fn next_frame(&mut self) -> (&[u8], u32, u32) {
        match self {
            FrameSource::Pattern { frame, tick } => {
                let t = *tick;
                *tick += 1;
                let width = frame.width() as u64;
                for (i, px) in frame.pixels_mut().chunks_exact_mut(3).enumerate() {
                    let x = i as u64 % width;
                    let y = i as u64 / width;
                    px[0] = (x + t) as u8;
                    px[1] = (y + t) as u8;
                    px[2] = (t * 4) as u8;
                }
                (frame.pixels(), frame.width(), frame.height())
            }
            FrameSource::Raw {
                data,
                width,
                height,
                frame_len,
                position,
            } => {
                if *position + *frame_len > data.len() {
                    *position = 0;
                }
                let start = *position;
                *position += *frame_len;
                (&data[start..start + *frame_len], *width, *height)
            }
        }
    }
}

/// Pause between frames for a target rate; `None` means unthrottled
fn frame_interval(fps: f64) -> CliResult<Option<Duration>> {
    if fps.is_nan() || fps <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(1.0 / fps)
        .map(Some)
        .map_err(|_| CliError::new(USAGE, format!("--fps {fps} is out of range")))
}

pub fn run(args: SendArgs) -> CliResult<i32> {
    let cancel = install_cancel_handler()?;

    let source_width = args.source_width.unwrap_or(args.width);
    let source_height = args.source_height.unwrap_or(args.height);
    let mut source = match &args.input {
        Some(path) => FrameSource::raw(path, source_width, source_height)?,
        None => FrameSource::pattern(source_width, source_height)?,
    };

    let config = ChannelConfig::new(args.width, args.height)
        .with_lock_timeout(Duration::from_millis(args.timeout_ms))
        .with_auto_remove(!args.keep)
        .with_lock_policy(args.policy.into());
    let mut sender = FrameSender::open_or_create(&args.channel.name, config)
        .map_err(|e| relay_error("cannot create channel", e))?;

    let interval = frame_interval(args.fps)?;
    let mut next_due = Instant::now();
    let mut report_at = Instant::now() + Duration::from_secs(1);
    let mut reported = SenderCounters::default();
    let mut attempts = 0u64;

    while !cancel.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| attempts >= count) {
            break;
        }

        let (pixels, width, height) = source.next_frame();
        let status = sender
            .publish(pixels, width, height, now_nanos())
            .map_err(|e| relay_error("publish failed", e))?;
        attempts += 1;

        if let PublishStatus::SkippedTimeout { reconstructed: true } = status {
            tracing::warn!(frame = attempts, "frame dropped, channel header rebuilt");
        }

        if Instant::now() >= report_at {
            let counters = sender.counters();
            tracing::info!(
                published = counters.published - reported.published,
                skipped_busy = counters.skipped_busy - reported.skipped_busy,
                skipped_timeout = counters.skipped_timeout - reported.skipped_timeout,
                "publish rate"
            );
            reported = counters;
            report_at += Duration::from_secs(1);
        }

        if let Some(interval) = interval {
            next_due += interval;
            let now = Instant::now();
            if next_due > now {
                thread::sleep(next_due - now);
            } else {
                // Fell behind; do not try to catch up with a burst
                next_due = now;
            }
        }
    }

    let counters = sender.counters();
    tracing::info!(
        attempts,
        published = counters.published,
        reconstructions = counters.reconstructions,
        "sender stopping"
    );
    Ok(SUCCESS)
}
