use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use shm_frame_relay::{now_nanos, Frame, FrameReceiver, FrameStats, StatsReport};

use crate::cmd::{install_cancel_handler, ReadMode, RecvArgs};
use crate::exit::{io_error, relay_error, CliResult, SUCCESS};

fn latency_since(write_time: u64) -> Duration {
    Duration::from_nanos(now_nanos().saturating_sub(write_time))
}

fn log_report(report: &StatsReport) {
    tracing::info!(
        fps = report.fps,
        avg_latency_us = report.avg_latency.as_micros() as u64,
        max_latency_us = report.max_latency.as_micros() as u64,
        "receive rate"
    );
}

fn write_snapshot(path: &Path, frame: &Frame) -> CliResult<()> {
    let file = File::create(path)
        .map_err(|e| io_error(&format!("cannot create {}", path.display()), e))?;
    frame
        .write_ppm(BufWriter::new(file))
        .map_err(|e| io_error(&format!("cannot write {}", path.display()), e))?;
    tracing::info!(file = %path.display(), width = frame.width(), height = frame.height(), "snapshot written");
    Ok(())
}

pub fn run(args: RecvArgs) -> CliResult<i32> {
    let cancel = install_cancel_handler()?;
    let mut receiver = FrameReceiver::new(&args.channel.name)
        .with_lock_timeout(Duration::from_millis(args.timeout_ms));

    tracing::info!(channel = %args.channel.name, "waiting for channel");
    let attached = receiver
        .wait_for_channel(Duration::from_millis(args.retry_ms), &cancel)
        .map_err(|e| relay_error("cannot open channel", e))?;
    if !attached {
        return Ok(SUCCESS);
    }

    let poll_interval = Duration::from_micros(args.poll_us);
    let mut stats = FrameStats::new();
    let mut received = 0u64;
    let mut last_frame: Option<Frame> = None;

    while !cancel.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| received >= count) {
            break;
        }

        let fresh = receiver
            .poll()
            .map_err(|e| relay_error("poll failed", e))?;
        if !fresh {
            thread::sleep(poll_interval);
            continue;
        }

        let latency = match args.mode {
            ReadMode::Copy => {
                let Some(frame) = receiver
                    .copy_frame()
                    .map_err(|e| relay_error("copy failed", e))?
                else {
                    continue;
                };
                let latency = latency_since(frame.write_time());
                if args.snapshot.is_some() {
                    last_frame = Some(frame);
                }
                latency
            }
            ReadMode::Share => {
                let Some(view) = receiver.view() else {
                    continue;
                };
                let latency = latency_since(view.record().write_time);
                let checksum = view
                    .pixels()
                    .iter()
                    .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
                tracing::trace!(checksum, "frame viewed in place");
                if args.snapshot.is_some() {
                    last_frame = Some(view.to_frame());
                }
                if !view.release() {
                    tracing::debug!("view invalidated by header rebuild");
                    continue;
                }
                latency
            }
        };

        received += 1;
        if let Some(report) = stats.record(latency) {
            log_report(&report);
        }
    }

    tracing::info!(received, "receiver stopping");
    if let (Some(path), Some(frame)) = (&args.snapshot, &last_frame) {
        write_snapshot(path, frame)?;
    }
    Ok(SUCCESS)
}
