//! In-car button panel client.
//!
//! Applies one button press to a running car's shared record and exits.
//! The manual moves (`up`/`down`) are only honoured in individual
//! service mode with the doors closed; every rejection reason gets its
//! own diagnostic line.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::debug;

use liftcore::floor;
use liftcore::shm::{CabGuard, CabStatus, SharedCab};

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "snake_case")]
enum Operation {
    /// Hold or reopen the doors
    Open,
    /// Close the doors early
    Close,
    /// Press the emergency stop
    Stop,
    /// Enter individual service mode
    ServiceOn,
    /// Leave individual service mode
    ServiceOff,
    /// Move one floor up (individual service, doors closed)
    Up,
    /// Move one floor down (individual service, doors closed)
    Down,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "In-car button panel for a running car")]
struct Args {
    /// Car name
    name: String,

    /// Button to press
    #[arg(value_enum)]
    operation: Operation,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cab = SharedCab::open(&args.name)
        .with_context(|| format!("no running car named {:?}", args.name))?;
    debug!("pressing {:?} in car {}", args.operation, args.name);

    let mut guard = cab.lock();
    match args.operation {
        Operation::Open => guard.set_open_button(true),
        Operation::Close => guard.set_close_button(true),
        Operation::Stop => guard.set_emergency_stop(true),
        Operation::ServiceOn => guard.set_individual_service_mode(true),
        Operation::ServiceOff => guard.set_individual_service_mode(false),
        Operation::Up | Operation::Down => {
            let dir = if matches!(args.operation, Operation::Up) {
                1
            } else {
                -1
            };
            if let Err(reason) = move_one_floor(&mut guard, dir) {
                drop(guard);
                println!("{}", reason);
                std::process::exit(1);
            }
        }
    }
    guard.notify_all();
    Ok(())
}

/// Set the destination one floor along, after checking every precondition
/// for a manual move.
fn move_one_floor(guard: &mut CabGuard<'_>, dir: i32) -> Result<(), String> {
    if !guard.individual_service_mode() {
        return Err("The car only takes manual moves in individual service mode.".to_string());
    }
    if guard.status() != Some(CabStatus::Closed) {
        return Err("The doors must be closed before the car can move.".to_string());
    }
    let current = guard
        .current_floor()
        .map_err(|e| format!("The car's shared state is damaged: {}.", e))?;
    let lowest = guard
        .lowest_floor()
        .map_err(|e| format!("The car's shared state is damaged: {}.", e))?;
    let highest = guard
        .highest_floor()
        .map_err(|e| format!("The car's shared state is damaged: {}.", e))?;

    match floor::step(current, dir) {
        Ok(target) if target >= lowest && target <= highest => {
            guard.set_destination_floor(target);
            Ok(())
        }
        _ if dir > 0 => Err("The car is already at its highest floor.".to_string()),
        _ => Err("The car is already at its lowest floor.".to_string()),
    }
}
