//! Safety sensor trigger tool.
//!
//! Flips the safety-related sensor flags in a running car's shared
//! record, for exercising the monitor: the door light curtain and the
//! overload sensor. Note that raising the obstruction flag while the
//! doors are parked is itself a state the monitor treats as a
//! consistency fault.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::debug;

use liftcore::shm::SharedCab;

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "snake_case")]
enum Sensor {
    /// Block the door light curtain
    ObstructionOn,
    /// Clear the door light curtain
    ObstructionOff,
    /// Trip the overload sensor
    Overload,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Trip a safety sensor on a running car")]
struct Args {
    /// Car name
    name: String,

    /// Sensor to flip
    #[arg(value_enum)]
    sensor: Sensor,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cab = SharedCab::open(&args.name)
        .with_context(|| format!("no running car named {:?}", args.name))?;
    debug!("flipping {:?} on car {}", args.sensor, args.name);

    let mut guard = cab.lock();
    match args.sensor {
        Sensor::ObstructionOn => guard.set_door_obstruction(true),
        Sensor::ObstructionOff => guard.set_door_obstruction(false),
        Sensor::Overload => guard.set_overload(true),
    }
    guard.notify_all();
    Ok(())
}
