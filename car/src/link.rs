//! Controller link: the car's network thread.
//!
//! Once per cycle the thread reconciles the actual TCP session with the
//! intended one (connected while the heartbeat is healthy and the car is
//! neither in individual service nor in emergency mode), mirrors the cab
//! state to the controller as deduplicated STATUS frames, polls for one
//! inbound target floor, and advances the safety heartbeat. The
//! heartbeat counter is the only tie to the safety monitor: the monitor
//! pins it back to 1, this thread increments it, and saturation means
//! the monitor is gone, so the car latches emergency mode, announces
//! it, and hangs up.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};

use liftcore::floor::Floor;
use liftcore::proto::{self, Message};
use liftcore::shm::{CabStatus, SharedCab, SAFETY_FAILED};
use liftcore::signal;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub fn run(
    cab: &SharedCab,
    name: &str,
    lowest: Floor,
    highest: Floor,
    controller: &str,
    delay: Duration,
) {
    let addr: SocketAddr = match controller.to_socket_addrs().ok().and_then(|mut a| a.next()) {
        Some(addr) => addr,
        None => {
            warn!("cannot resolve controller address {:?}", controller);
            return;
        }
    };

    let mut conn: Option<TcpStream> = None;
    let mut last_status: Option<String> = None;

    while !signal::shutdown_requested() {
        // Snapshot the intent and the state to mirror, then work unlocked.
        let (intended, service, status_line) = {
            let guard = cab.lock();
            let healthy = matches!(guard.safety_system(), 1 | 2);
            let service = guard.individual_service_mode();
            let intended = healthy && !service && !guard.emergency_mode();
            let status_line = match (
                guard.status(),
                guard.current_floor(),
                guard.destination_floor(),
            ) {
                (Some(status), Ok(current), Ok(destination)) => Some(
                    Message::Status {
                        status,
                        current,
                        destination,
                    }
                    .encode(),
                ),
                _ => None,
            };
            (intended, service, status_line)
        };

        if intended && conn.is_none() {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(mut stream) => {
                    let hello = Message::Register {
                        name: name.to_string(),
                        lowest,
                        highest,
                    }
                    .encode();
                    let ready = stream
                        .set_read_timeout(Some(POLL_TIMEOUT))
                        .and_then(|_| proto::write_frame(&mut stream, &hello));
                    match ready {
                        Ok(()) => {
                            info!("connected to controller at {}", addr);
                            last_status = None;
                            conn = Some(stream);
                        }
                        Err(e) => debug!("registration with controller failed: {}", e),
                    }
                }
                Err(e) => debug!("controller not reachable: {}", e),
            }
        }

        if !intended {
            if let Some(mut stream) = conn.take() {
                if service {
                    let _ =
                        proto::write_frame(&mut stream, &Message::IndividualService.encode());
                }
                info!("disconnected from controller");
                last_status = None;
            }
        }

        let mut lost = false;
        if let Some(stream) = conn.as_mut() {
            if let Some(line) = status_line {
                if last_status.as_deref() != Some(line.as_str()) {
                    match proto::write_frame(stream, &line) {
                        Ok(()) => last_status = Some(line),
                        Err(e) => {
                            debug!("status send failed: {}", e);
                            lost = true;
                        }
                    }
                }
            }
            if !lost {
                match proto::read_frame(stream) {
                    Ok(Some(text)) => handle_inbound(cab, &text),
                    Ok(None) => {}
                    Err(e) => {
                        debug!("controller link lost: {}", e);
                        lost = true;
                    }
                }
            }
        }
        if lost {
            conn = None;
            last_status = None;
        }

        // Heartbeat: the safety monitor pins the counter back to 1; if it
        // saturates the monitor is gone. The broadcast wakes the monitor
        // so a short cycle delay cannot outrun its 1 s timer.
        let mut guard = cab.lock();
        let heartbeat = guard.safety_system().saturating_add(1).min(SAFETY_FAILED);
        guard.set_safety_system(heartbeat);
        guard.notify_all();
        if heartbeat == SAFETY_FAILED && !guard.emergency_mode() {
            guard.set_emergency_mode(true);
            drop(guard);
            warn!("safety monitor heartbeat lost; entering emergency mode");
            if let Some(mut stream) = conn.take() {
                let _ = proto::write_frame(&mut stream, &Message::Emergency.encode());
                last_status = None;
            }
        } else {
            guard.wait_timeout(delay);
        }
    }
}

/// Apply one frame from the controller under the cab mutex.
fn handle_inbound(cab: &SharedCab, text: &str) {
    match Message::parse(text) {
        Ok(Message::Floor { target }) => {
            let mut guard = cab.lock();
            let parked_here = guard.status() == Some(CabStatus::Closed)
                && guard.current_floor().ok() == Some(target);
            if parked_here {
                // Already waiting there with the doors closed: just open.
                guard.set_status(CabStatus::Opening);
            } else {
                guard.set_destination_floor(target);
            }
            guard.notify_all();
        }
        Ok(other) => debug!("unexpected message from controller: {:?}", other),
        Err(e) => debug!("unparseable frame from controller: {}", e),
    }
}
