use shm_frame_relay::{inspect_channel, remove_channel};

use crate::cmd::ChannelArgs;
use crate::exit::{relay_error, CliResult, FAILURE, SUCCESS};

pub fn run_inspect(args: ChannelArgs) -> CliResult<i32> {
    let info = inspect_channel(&args.name).map_err(|e| relay_error("cannot inspect channel", e))?;
    let lock = info.lock;

    println!("Channel:       {}", info.name);
    println!("Region size:   {} bytes", info.size);
    println!("Header ready:  {}", info.ready);
    println!("Status:        {:?}", info.status);
    println!("Producer PID:  {}", info.producer_pid);
    println!("Frame:         {}x{}", info.record.width, info.record.height);
    println!("Capture time:  {}", info.record.capture_time);
    println!("Write time:    {}", info.record.write_time);
    println!(
        "Lock:          epoch {} readers {} exclusive {} upgradable {} pending {} owner {} releases {}",
        lock.epoch,
        lock.readers,
        lock.exclusive,
        lock.upgradable,
        lock.upgrade_pending,
        lock.owner_pid,
        lock.releases
    );
    Ok(SUCCESS)
}

pub fn run_remove(args: ChannelArgs) -> CliResult<i32> {
    let removed = remove_channel(&args.name).map_err(|e| relay_error("cannot remove channel", e))?;
    if removed {
        println!("Removed channel '{}'", args.name);
        Ok(SUCCESS)
    } else {
        println!("No channel named '{}'", args.name);
        Ok(FAILURE)
    }
}
