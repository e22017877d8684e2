//! Door and motion state machine.
//!
//! Runs under the cab mutex. The mutex is dropped across every timed
//! stage (door travel, floor-to-floor travel) and the status is re-read
//! after reacquiring it, so a preemption by the safety monitor (most
//! importantly the obstruction reversal of a closing door) wins over
//! the stage that was in flight. Button flags are consumed on
//! observation.

use std::time::{Duration, Instant};

use log::debug;

use liftcore::floor;
use liftcore::shm::{CabStatus, SharedCab};
use liftcore::signal;

/// Wait used while parked with nothing to do.
const IDLE_WAIT: Duration = Duration::from_millis(50);

pub fn run(cab: &SharedCab, delay: Duration) {
    let mut opened_at = Instant::now();

    while !signal::shutdown_requested() {
        let mut guard = cab.lock();
        let Some(status) = guard.status() else {
            // Corrupted status byte. The safety monitor latches emergency
            // mode for this; the car just stands still.
            drop(guard);
            std::thread::sleep(IDLE_WAIT);
            continue;
        };

        match status {
            CabStatus::Closed => {
                if guard.open_button() {
                    guard.set_open_button(false);
                    guard.set_status(CabStatus::Opening);
                    guard.notify_all();
                    continue;
                }
                if guard.close_button() {
                    guard.set_close_button(false);
                }
                let (Ok(current), Ok(destination)) =
                    (guard.current_floor(), guard.destination_floor())
                else {
                    drop(guard);
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                };
                if current != destination && !guard.emergency_mode() {
                    let in_range = match (guard.lowest_floor(), guard.highest_floor()) {
                        (Ok(lo), Ok(hi)) => destination >= lo && destination <= hi,
                        _ => false,
                    };
                    if in_range {
                        guard.set_status(CabStatus::Between);
                    } else {
                        debug!(
                            "destination {} outside the served range, staying at {}",
                            destination, current
                        );
                        guard.set_destination_floor(current);
                    }
                    guard.notify_all();
                } else {
                    guard.wait_timeout(IDLE_WAIT);
                }
            }

            CabStatus::Opening => {
                drop(guard);
                std::thread::sleep(delay);
                let mut guard = cab.lock();
                if guard.status() == Some(CabStatus::Opening) {
                    guard.set_status(CabStatus::Open);
                    guard.notify_all();
                }
                opened_at = Instant::now();
            }

            CabStatus::Open => {
                if guard.open_button() {
                    guard.set_open_button(false);
                    opened_at = Instant::now();
                }
                if guard.close_button() {
                    guard.set_close_button(false);
                    guard.set_status(CabStatus::Closing);
                    guard.notify_all();
                } else if opened_at.elapsed() >= delay && !guard.individual_service_mode() {
                    guard.set_status(CabStatus::Closing);
                    guard.notify_all();
                } else {
                    // In individual service the door stays open until told
                    // otherwise; wake periodically for the buttons.
                    let wait = if guard.individual_service_mode() {
                        IDLE_WAIT
                    } else {
                        delay
                            .saturating_sub(opened_at.elapsed())
                            .max(Duration::from_millis(1))
                    };
                    guard.wait_timeout(wait);
                }
            }

            CabStatus::Closing => {
                drop(guard);
                std::thread::sleep(delay);
                let mut guard = cab.lock();
                // The safety monitor reverses an obstructed close; only an
                // undisturbed Closing may complete.
                if guard.status() == Some(CabStatus::Closing) {
                    guard.set_status(CabStatus::Closed);
                    guard.notify_all();
                }
            }

            CabStatus::Between => {
                drop(guard);
                std::thread::sleep(delay);
                let mut guard = cab.lock();
                if guard.status() != Some(CabStatus::Between) {
                    continue;
                }
                let (Ok(current), Ok(destination), Ok(lo), Ok(hi)) = (
                    guard.current_floor(),
                    guard.destination_floor(),
                    guard.lowest_floor(),
                    guard.highest_floor(),
                ) else {
                    continue;
                };
                match floor::next_toward(current, destination, lo, hi) {
                    Ok(next) => {
                        guard.set_current_floor(next);
                        if next == destination {
                            // Arriving opens the doors; in individual
                            // service the car just parks.
                            let arrived = if guard.individual_service_mode() {
                                CabStatus::Closed
                            } else {
                                CabStatus::Opening
                            };
                            guard.set_status(arrived);
                        }
                        guard.notify_all();
                    }
                    Err(_) => {
                        // The destination slipped outside the served range
                        // mid-travel: stop at the current floor.
                        guard.set_destination_floor(current);
                        guard.set_status(CabStatus::Opening);
                        guard.notify_all();
                    }
                }
            }
        }
    }
}
