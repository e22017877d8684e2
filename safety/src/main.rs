//! Safety monitor process.
//!
//! Attaches to a running car's shared record and enforces the failsafes
//! that must not depend on the car's own control flow: reversing an
//! obstructed door, latching emergency mode on the stop button, the
//! overload sensor or a damaged record, and keeping the heartbeat
//! counter pinned so the car knows its monitor is alive. Runs until
//! SIGINT; it never clears emergency mode.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use liftcore::shm::{self, CabGuard, CabRecord, CabStatus, SharedCab, SAFETY_FAILED};
use liftcore::signal;

/// Longest sleep between validation passes; any state change wakes the
/// monitor earlier through the condition variable.
const CYCLE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Safety monitor for one elevator car")]
struct Args {
    /// Car name
    name: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    signal::install().context("cannot install signal handlers")?;
    let cab = SharedCab::open(&args.name)
        .with_context(|| format!("no running car named {:?}", args.name))?;
    info!("monitoring car {}", args.name);

    while !signal::shutdown_requested() {
        let mut guard = cab.lock();
        guard.wait_timeout(CYCLE);
        if signal::shutdown_requested() {
            break;
        }
        if enforce(&mut guard) {
            guard.notify_all();
        }
    }

    info!("monitor for car {} stopped", args.name);
    Ok(())
}

/// One monitor pass over a locked record. Returns true when a change
/// worth announcing was made.
fn enforce(guard: &mut CabGuard<'_>) -> bool {
    let mut changed = false;

    // Heartbeat: pin the counter back to a healthy 1. This is
    // housekeeping between the two heartbeat parties, not a state
    // change to announce; broadcasting it would wake the car's
    // network thread right back into another increment. A saturated
    // counter stays put; the car has already latched emergency mode.
    match guard.safety_system() {
        0 | 2 => guard.set_safety_system(1),
        _ => {}
    }

    // An obstructed door must never finish closing.
    if guard.door_obstruction() && guard.status() == Some(CabStatus::Closing) {
        guard.set_status(CabStatus::Opening);
        changed = true;
    }

    if guard.emergency_stop() && !guard.emergency_mode() {
        println!("The emergency stop button has been pressed!");
        guard.set_emergency_stop(false);
        guard.set_emergency_mode(true);
        changed = true;
    }

    if guard.overload() && !guard.emergency_mode() {
        println!("The overload sensor has been tripped!");
        guard.set_emergency_mode(true);
        changed = true;
    }

    if !guard.emergency_mode() {
        if let Err(fault) = validate(guard.raw()) {
            println!("Data consistency error!");
            error!("shared state invariant violated: {}", fault);
            guard.set_emergency_mode(true);
            changed = true;
        }
    }

    changed
}

/// Check every record invariant. Returns a description of the first
/// violation found.
fn validate(rec: &CabRecord) -> Result<(), String> {
    let current =
        shm::parse_label(&rec.current_floor).map_err(|e| format!("current floor: {}", e))?;
    let destination = shm::parse_label(&rec.destination_floor)
        .map_err(|e| format!("destination floor: {}", e))?;
    let lowest =
        shm::parse_label(&rec.lowest_floor).map_err(|e| format!("lowest floor: {}", e))?;
    let highest =
        shm::parse_label(&rec.highest_floor).map_err(|e| format!("highest floor: {}", e))?;

    let status = CabStatus::from_u8(rec.status)
        .ok_or_else(|| format!("status byte holds {}", rec.status))?;

    for (name, value) in [
        ("open_button", rec.open_button),
        ("close_button", rec.close_button),
        ("door_obstruction", rec.door_obstruction),
        ("overload", rec.overload),
        ("emergency_stop", rec.emergency_stop),
        ("individual_service_mode", rec.individual_service_mode),
        ("emergency_mode", rec.emergency_mode),
    ] {
        if value > 1 {
            return Err(format!("flag {} holds {}", name, value));
        }
    }
    if rec.safety_system > SAFETY_FAILED {
        return Err(format!("heartbeat counter holds {}", rec.safety_system));
    }

    if rec.door_obstruction == 1
        && !matches!(status, CabStatus::Opening | CabStatus::Closing)
    {
        return Err(format!("door obstruction while {}", status));
    }

    if lowest >= highest {
        return Err(format!("served range {}..{} is inverted", lowest, highest));
    }
    if current < lowest || current > highest {
        return Err(format!(
            "current floor {} outside {}..{}",
            current, lowest, highest
        ));
    }
    if destination < lowest || destination > highest {
        return Err(format!(
            "destination floor {} outside {}..{}",
            destination, lowest, highest
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftcore::floor::Floor;

    fn test_cab(tag: &str) -> SharedCab {
        let name = format!("{}{}", tag, std::process::id());
        SharedCab::create(
            &name,
            Floor::parse("1").unwrap(),
            Floor::parse("9").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_enforce_reverses_an_obstructed_close() {
        let cab = test_cab("mo");
        let mut guard = cab.lock();
        guard.set_status(CabStatus::Closing);
        guard.set_door_obstruction(true);

        assert!(enforce(&mut guard));
        assert_eq!(guard.status(), Some(CabStatus::Opening));
        assert!(!guard.emergency_mode());
    }

    #[test]
    fn test_enforce_latches_the_stop_button() {
        let cab = test_cab("ms");
        let mut guard = cab.lock();
        guard.set_emergency_stop(true);

        assert!(enforce(&mut guard));
        assert!(!guard.emergency_stop());
        assert!(guard.emergency_mode());

        // Latching: a later pass never clears it.
        enforce(&mut guard);
        assert!(guard.emergency_mode());
    }

    #[test]
    fn test_enforce_latches_the_overload_sensor() {
        let cab = test_cab("mv");
        let mut guard = cab.lock();
        guard.set_overload(true);

        assert!(enforce(&mut guard));
        assert!(guard.emergency_mode());
    }

    #[test]
    fn test_enforce_pins_the_heartbeat() {
        let cab = test_cab("mh");
        let mut guard = cab.lock();

        // Bootstrap from uninitialised, then pin a car increment back.
        enforce(&mut guard);
        assert_eq!(guard.safety_system(), 1);
        guard.set_safety_system(2);
        enforce(&mut guard);
        assert_eq!(guard.safety_system(), 1);
        // A saturated counter stays saturated.
        guard.set_safety_system(SAFETY_FAILED);
        guard.set_emergency_mode(true);
        enforce(&mut guard);
        assert_eq!(guard.safety_system(), SAFETY_FAILED);
    }

    #[test]
    fn test_enforce_latches_on_a_damaged_record() {
        let cab = test_cab("md");
        let mut guard = cab.lock();
        guard.set_status(CabStatus::Closed);
        guard.set_door_obstruction(true);

        // Obstruction with parked doors violates the record invariants.
        assert!(enforce(&mut guard));
        assert!(guard.emergency_mode());
    }

    fn healthy_record() -> CabRecord {
        // The embedded mutex and condvar are never touched by validate.
        let mut rec: CabRecord = unsafe { std::mem::zeroed() };
        rec.current_floor = shm::pack_label(Floor::parse("3").unwrap());
        rec.destination_floor = shm::pack_label(Floor::parse("7").unwrap());
        rec.lowest_floor = shm::pack_label(Floor::parse("B1").unwrap());
        rec.highest_floor = shm::pack_label(Floor::parse("9").unwrap());
        rec.status = CabStatus::Closed as u8;
        rec.safety_system = 1;
        rec
    }

    #[test]
    fn test_validate_accepts_a_healthy_record() {
        assert_eq!(validate(&healthy_record()), Ok(()));
    }

    #[test]
    fn test_validate_rejects_a_bad_status_byte() {
        let mut rec = healthy_record();
        rec.status = 9;
        assert!(validate(&rec).is_err());
    }

    #[test]
    fn test_validate_rejects_a_wild_flag() {
        let mut rec = healthy_record();
        rec.overload = 2;
        assert!(validate(&rec).is_err());
    }

    #[test]
    fn test_validate_rejects_obstruction_with_parked_doors() {
        let mut rec = healthy_record();
        rec.door_obstruction = 1;
        assert!(validate(&rec).is_err());
        rec.status = CabStatus::Closing as u8;
        assert_eq!(validate(&rec), Ok(()));
        rec.status = CabStatus::Opening as u8;
        assert_eq!(validate(&rec), Ok(()));
    }

    #[test]
    fn test_validate_rejects_floors_outside_the_range() {
        let mut rec = healthy_record();
        rec.current_floor = shm::pack_label(Floor::parse("99").unwrap());
        assert!(validate(&rec).is_err());

        let mut rec = healthy_record();
        rec.destination_floor = shm::pack_label(Floor::parse("B2").unwrap());
        assert!(validate(&rec).is_err());
    }

    #[test]
    fn test_validate_rejects_mangled_labels() {
        let mut rec = healthy_record();
        rec.current_floor = [b'9', b'9', b'9', b'9'];
        assert!(validate(&rec).is_err());
    }

    #[test]
    fn test_validate_rejects_a_runaway_heartbeat() {
        let mut rec = healthy_record();
        rec.safety_system = 4;
        assert!(validate(&rec).is_err());
    }
}
