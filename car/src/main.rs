//! One elevator car process.
//!
//! Creates the cab's shared-memory record and runs two threads over it:
//! the door/motion state machine on the main thread and the controller
//! link on a background thread. Button clients and the safety monitor
//! attach to the same record from their own processes. On SIGINT both
//! threads unwind and the segment is unlinked.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

use liftcore::floor::Floor;
use liftcore::shm::{self, SharedCab};
use liftcore::signal;

mod fsm;
mod link;

#[derive(Parser, Debug)]
#[command(author, version, about = "One elevator car")]
struct Args {
    /// Car name (ASCII alphanumeric, at most 31 characters)
    name: String,

    /// Lowest served floor (e.g. B2)
    lowest: String,

    /// Highest served floor (e.g. 10)
    highest: String,

    /// Base delay for door stages and per-floor travel, in milliseconds
    delay_ms: u64,

    /// Controller address
    #[arg(long, default_value = liftcore::CONTROLLER_ADDR)]
    controller: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !shm::valid_name(&args.name) {
        bail!(
            "invalid car name {:?} (1..={} ASCII alphanumeric characters)",
            args.name,
            shm::NAME_MAX
        );
    }
    let lowest: Floor = args
        .lowest
        .parse()
        .with_context(|| format!("invalid lowest floor {:?}", args.lowest))?;
    let highest: Floor = args
        .highest
        .parse()
        .with_context(|| format!("invalid highest floor {:?}", args.highest))?;
    if lowest >= highest {
        bail!("lowest floor {} must lie below highest floor {}", lowest, highest);
    }
    if args.delay_ms == 0 {
        bail!("delay must be at least one millisecond");
    }
    let delay = Duration::from_millis(args.delay_ms);

    signal::install().context("cannot install signal handlers")?;

    let cab = Arc::new(SharedCab::create(&args.name, lowest, highest)?);
    info!(
        "car {} serving {}..{}, segment {}",
        args.name,
        lowest,
        highest,
        cab.segment()
    );

    let link = {
        let cab = Arc::clone(&cab);
        let name = args.name.clone();
        let controller = args.controller.clone();
        thread::Builder::new()
            .name("car-link".to_string())
            .spawn(move || link::run(&cab, &name, lowest, highest, &controller, delay))
            .context("cannot spawn the controller link thread")?
    };

    fsm::run(&cab, delay);

    // Wake the link thread so it notices the shutdown flag promptly.
    cab.lock().notify_all();
    let _ = link.join();
    info!("car {} stopped", args.name);
    Ok(())
}
