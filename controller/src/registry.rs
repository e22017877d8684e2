//! Car registry: per-car floor queues and hall-call selection.
//!
//! Each connected car has one record holding its service range, the last
//! reported state, an outbound channel to the connection's writer task,
//! and a queue of pending target floors kept in SCAN order: the head is
//! the floor already issued to the car, followed by the rest of the
//! current sweep (moving away from the car), followed by the return
//! sweep (moving back). Records are keyed by name and kept for the
//! lifetime of the process; a reconnecting car reuses its slot with a
//! flushed queue.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;

use liftcore::floor::{self, Floor};
use liftcore::proto::Message;
use liftcore::shm::CabStatus;

struct CarRecord {
    lowest: Floor,
    highest: Floor,
    current: Floor,
    destination: Floor,
    status: CabStatus,
    queue: VecDeque<Floor>,
    /// Feeds the connection's writer task; `None` while disconnected.
    tx: Option<UnboundedSender<String>>,
}

impl CarRecord {
    /// Position used for sweep decisions: a car that is already moving
    /// (or committed to moving, doors closing) is treated as one floor
    /// along, so a new call cannot be slotted just behind it.
    fn effective_position(&self) -> Floor {
        if matches!(self.status, CabStatus::Closing | CabStatus::Between)
            && self.current != self.destination
        {
            let dir = (self.destination.rank() - self.current.rank()).signum();
            floor::step(self.current, dir).unwrap_or(self.current)
        } else {
            self.current
        }
    }

    /// Current sweep direction: from the reported motion when moving,
    /// else from the issued head, else from the floor being inserted.
    fn sweep_dir(&self, fallback: Floor) -> i32 {
        let eff = self.effective_position();
        let mut dir = (self.destination.rank() - self.current.rank()).signum();
        if dir == 0 {
            if let Some(head) = self.queue.front() {
                dir = (head.rank() - eff.rank()).signum();
            }
        }
        if dir == 0 {
            dir = (fallback.rank() - eff.rank()).signum();
        }
        if dir == 0 {
            1
        } else {
            dir
        }
    }
}

/// Insert `floor` into a SCAN-ordered queue for a car sweeping in
/// direction `dir` (+1 up, −1 down). Rejects duplicates.
///
/// The queue shape is `[head][same-sweep run][return run]`: the head
/// never moves (the car was already told to go there), floors beyond the
/// head on the same sweep stay sorted in travel order, and everything on
/// the wrong side of the head waits for the return sweep, sorted for
/// travel back.
pub fn scan_insert(queue: &mut VecDeque<Floor>, dir: i32, floor: Floor) -> bool {
    if queue.contains(&floor) {
        return false;
    }
    if queue.is_empty() {
        queue.push_back(floor);
        return true;
    }

    // Normalise so "up" is always the direction of travel.
    let key = |f: Floor| dir as i64 * f.rank() as i64;
    let head = key(queue[0]);
    let new = key(floor);

    let mut i = 1;
    if new > head {
        // Same sweep as the head: keep the run beyond the head ascending.
        while i < queue.len() {
            let q = key(queue[i]);
            if q <= head || q > new {
                break;
            }
            i += 1;
        }
    } else {
        // Return sweep: skip past the current sweep's run, then keep the
        // return run descending.
        while i < queue.len() && key(queue[i]) > head {
            i += 1;
        }
        while i < queue.len() && key(queue[i]) > new {
            i += 1;
        }
    }
    queue.insert(i, floor);
    true
}

/// All car records, guarded by the single dispatcher-wide mutex in main.
pub struct Registry {
    cars: BTreeMap<String, CarRecord>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            cars: BTreeMap::new(),
        }
    }

    /// Register a car or rebind a reconnecting one. The queue is flushed
    /// and the reported state reset until the first STATUS arrives.
    pub fn register(
        &mut self,
        name: &str,
        lowest: Floor,
        highest: Floor,
        tx: UnboundedSender<String>,
    ) {
        let known = self.cars.contains_key(name);
        self.cars.insert(
            name.to_string(),
            CarRecord {
                lowest,
                highest,
                current: lowest,
                destination: lowest,
                status: CabStatus::Closed,
                queue: VecDeque::new(),
                tx: Some(tx),
            },
        );
        info!(
            "car {} {} serving {}..{}",
            name,
            if known { "reconnected" } else { "registered" },
            lowest,
            highest
        );
    }

    /// Mark a car disconnected and free its queue. The record stays for
    /// a later reconnect.
    pub fn detach(&mut self, name: &str) {
        if let Some(record) = self.cars.get_mut(name) {
            if record.tx.take().is_some() {
                record.queue.clear();
                info!("car {} detached", name);
            }
        }
    }

    /// Apply a STATUS report. When the car starts opening its doors at
    /// the head of its queue, the head is served: pop it and issue the
    /// next target, if any.
    pub fn on_status(
        &mut self,
        name: &str,
        status: CabStatus,
        current: Floor,
        destination: Floor,
    ) {
        let Some(record) = self.cars.get_mut(name) else {
            debug!("status from unknown car {}", name);
            return;
        };
        record.status = status;
        record.current = current;
        record.destination = destination;

        if status == CabStatus::Opening && record.queue.front() == Some(&current) {
            record.queue.pop_front();
            if let Some(next) = record.queue.front().copied() {
                send_to_car(name, &record.tx, Message::Floor { target: next });
            }
        }
    }

    /// Route a hall call: pick the best car, queue pickup then drop-off,
    /// and issue a new target if the queue head changed. Returns the
    /// chosen car's name.
    pub fn handle_call(&mut self, from: Floor, to: Floor) -> Option<String> {
        let name = self.select_car(from, to)?;
        let record = self.cars.get_mut(&name)?;

        let old_head = record.queue.front().copied();
        let dir = record.sweep_dir(from);
        scan_insert(&mut record.queue, dir, from);
        let dir = record.sweep_dir(to);
        scan_insert(&mut record.queue, dir, to);

        if record.queue.front().copied() != old_head {
            if let Some(head) = record.queue.front().copied() {
                send_to_car(&name, &record.tx, Message::Floor { target: head });
            }
        }
        Some(name)
    }

    /// Lowest ETA wins; ties go to the lexicographically smaller name
    /// (the map iterates in name order). A car is a candidate only while
    /// connected and serving both floors.
    fn select_car(&self, from: Floor, to: Floor) -> Option<String> {
        let mut best: Option<(i64, &str)> = None;
        for (name, record) in &self.cars {
            if record.tx.is_none() {
                continue;
            }
            if from < record.lowest
                || from > record.highest
                || to < record.lowest
                || to > record.highest
            {
                continue;
            }
            let eta = record.effective_position().distance(from) as i64
                + record.queue.len() as i64;
            if best.map_or(true, |(b, _)| eta < b) {
                best = Some((eta, name.as_str()));
            }
        }
        best.map(|(_, name)| name.to_string())
    }
}

fn send_to_car(name: &str, tx: &Option<UnboundedSender<String>>, message: Message) {
    if let Some(tx) = tx {
        if tx.send(message.encode()).is_err() {
            debug!("writer for car {} is gone", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn floor(label: &str) -> Floor {
        Floor::parse(label).unwrap()
    }

    fn queue(labels: &[&str]) -> VecDeque<Floor> {
        labels.iter().map(|l| floor(l)).collect()
    }

    fn add_car(
        registry: &mut Registry,
        name: &str,
        lowest: &str,
        highest: &str,
        at: &str,
    ) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        registry.register(name, floor(lowest), floor(highest), tx);
        registry.on_status(name, CabStatus::Closed, floor(at), floor(at));
        rx
    }

    #[test]
    fn test_scan_insert_keeps_the_sweep_sorted() {
        let mut q = queue(&["3"]);
        assert!(scan_insert(&mut q, 1, floor("7")));
        assert!(scan_insert(&mut q, 1, floor("5")));
        assert_eq!(q, queue(&["3", "5", "7"]));
    }

    #[test]
    fn test_scan_insert_sends_passed_floors_to_the_return_sweep() {
        // Car heading up with 10 already issued: 4 and 3 have effectively
        // been passed, so they are served on the way back down, nearest
        // to the turnaround first.
        let mut q = queue(&["10"]);
        assert!(scan_insert(&mut q, 1, floor("4")));
        assert!(scan_insert(&mut q, 1, floor("3")));
        assert_eq!(q, queue(&["10", "4", "3"]));
    }

    #[test]
    fn test_scan_insert_slots_between_sweep_stops() {
        let mut q = queue(&["10", "12", "4", "3"]);
        assert!(scan_insert(&mut q, 1, floor("11")));
        assert_eq!(q, queue(&["10", "11", "12", "4", "3"]));
        assert!(scan_insert(&mut q, 1, floor("7")));
        assert_eq!(q, queue(&["10", "11", "12", "7", "4", "3"]));
    }

    #[test]
    fn test_scan_insert_downward_sweep_is_symmetric() {
        let mut q = queue(&["B1"]);
        assert!(scan_insert(&mut q, -1, floor("B2")));
        assert!(scan_insert(&mut q, -1, floor("5")));
        assert_eq!(q, queue(&["B1", "B2", "5"]));
    }

    #[test]
    fn test_scan_insert_rejects_duplicates() {
        let mut q = queue(&["3", "5"]);
        assert!(!scan_insert(&mut q, 1, floor("5")));
        assert_eq!(q, queue(&["3", "5"]));
    }

    #[test]
    fn test_call_on_idle_car_issues_the_pickup() {
        let mut registry = Registry::new();
        let mut rx = add_car(&mut registry, "A", "1", "10", "1");

        assert_eq!(registry.handle_call(floor("3"), floor("7")), Some("A".into()));
        assert_eq!(rx.try_recv().unwrap(), "FLOOR 3");
        // Second insert joins the same sweep behind the head: no new push.
        assert!(rx.try_recv().is_err());

        // Doors opening at the pickup floor serve the head and issue the
        // drop-off.
        registry.on_status("A", CabStatus::Opening, floor("3"), floor("3"));
        assert_eq!(rx.try_recv().unwrap(), "FLOOR 7");
    }

    #[test]
    fn test_selection_prefers_the_nearer_car() {
        let mut registry = Registry::new();
        let _rx_a = add_car(&mut registry, "A", "1", "10", "1");
        let _rx_b = add_car(&mut registry, "B", "1", "10", "5");

        assert_eq!(registry.handle_call(floor("6"), floor("8")), Some("B".into()));
    }

    #[test]
    fn test_selection_ties_go_to_the_smaller_name() {
        let mut registry = Registry::new();
        let _rx_b = add_car(&mut registry, "B", "1", "10", "3");
        let _rx_a = add_car(&mut registry, "A", "1", "10", "3");

        assert_eq!(registry.handle_call(floor("5"), floor("6")), Some("A".into()));
    }

    #[test]
    fn test_selection_counts_a_moving_car_one_floor_along() {
        let mut registry = Registry::new();
        let _rx_a = add_car(&mut registry, "A", "1", "10", "3");
        let _rx_b = add_car(&mut registry, "B", "1", "10", "5");
        // B is closing its doors, committed toward 3: effectively at 4.
        registry.on_status("B", CabStatus::Closing, floor("5"), floor("3"));

        assert_eq!(registry.handle_call(floor("4"), floor("1")), Some("B".into()));
    }

    #[test]
    fn test_selection_requires_both_floors_in_range() {
        let mut registry = Registry::new();
        let _rx = add_car(&mut registry, "A", "1", "10", "1");

        assert_eq!(registry.handle_call(floor("B1"), floor("5")), None);
        assert_eq!(registry.handle_call(floor("5"), floor("12")), None);
    }

    #[test]
    fn test_detached_car_takes_no_calls() {
        let mut registry = Registry::new();
        let _rx = add_car(&mut registry, "A", "1", "10", "1");
        registry.detach("A");

        assert_eq!(registry.handle_call(floor("3"), floor("7")), None);
    }

    #[test]
    fn test_reconnect_flushes_the_queue() {
        let mut registry = Registry::new();
        let _rx = add_car(&mut registry, "A", "1", "10", "1");
        registry.handle_call(floor("3"), floor("7"));

        let mut rx = add_car(&mut registry, "A", "1", "10", "1");
        // Old targets are gone: a new call starts a fresh queue.
        assert_eq!(registry.handle_call(floor("2"), floor("4")), Some("A".into()));
        assert_eq!(rx.try_recv().unwrap(), "FLOOR 2");
    }
}
