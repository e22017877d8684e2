//! Shared cab record.
//!
//! Every car owns one named POSIX shared-memory segment that button
//! clients and the safety monitor attach to. The segment holds a single
//! fixed-size record:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ pthread_mutex_t   (PTHREAD_PROCESS_SHARED)     │
//! │ pthread_cond_t    (PTHREAD_PROCESS_SHARED)     │
//! ├────────────────────────────────────────────────┤
//! │ current_floor     [u8; 4]  label + NUL         │
//! │ destination_floor [u8; 4]                      │
//! │ lowest_floor      [u8; 4]  written at creation │
//! │ highest_floor     [u8; 4]                      │
//! │ status            u8       door/motion state   │
//! │ open_button .. emergency_mode   u8 flags       │
//! │ safety_system     u8       heartbeat counter   │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! All field access goes through [`CabGuard`], which holds the in-segment
//! mutex. Writers that change anything observable broadcast the condition
//! variable so the car loops and the monitor wake promptly.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::floor::{Floor, FloorError};

/// Longest accepted car name.
pub const NAME_MAX: usize = 31;

/// Bytes reserved for one floor label (3 characters + NUL).
pub const LABEL_BYTES: usize = 4;

/// Heartbeat value meaning the safety monitor has been absent too long.
pub const SAFETY_FAILED: u8 = 3;

/// Door/motion state of a cab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CabStatus {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
    Between = 4,
}

impl CabStatus {
    pub fn from_u8(raw: u8) -> Option<CabStatus> {
        match raw {
            0 => Some(CabStatus::Opening),
            1 => Some(CabStatus::Open),
            2 => Some(CabStatus::Closing),
            3 => Some(CabStatus::Closed),
            4 => Some(CabStatus::Between),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CabStatus::Opening => "OPENING",
            CabStatus::Open => "OPEN",
            CabStatus::Closing => "CLOSING",
            CabStatus::Closed => "CLOSED",
            CabStatus::Between => "BETWEEN",
        }
    }
}

impl fmt::Display for CabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CabStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPENING" => Ok(CabStatus::Opening),
            "OPEN" => Ok(CabStatus::Open),
            "CLOSING" => Ok(CabStatus::Closing),
            "CLOSED" => Ok(CabStatus::Closed),
            "BETWEEN" => Ok(CabStatus::Between),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid car name (1..={NAME_MAX} ASCII alphanumeric characters)")]
    BadName,
    #[error("shm_open({name}) failed: {err}")]
    Open { name: String, err: io::Error },
    #[error("ftruncate({name}) failed: {err}")]
    Resize { name: String, err: io::Error },
    #[error("{name} is not a cab segment (wrong size)")]
    WrongSize { name: String },
    #[error("mmap({name}) failed: {err}")]
    Map { name: String, err: io::Error },
    #[error("pthread initialisation failed: {err}")]
    Sync { err: io::Error },
}

/// The record placed in shared memory. Field layout is fixed; all
/// multi-process synchronisation goes through the embedded mutex.
#[repr(C)]
pub struct CabRecord {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    pub current_floor: [u8; LABEL_BYTES],
    pub destination_floor: [u8; LABEL_BYTES],
    pub lowest_floor: [u8; LABEL_BYTES],
    pub highest_floor: [u8; LABEL_BYTES],
    pub status: u8,
    pub open_button: u8,
    pub close_button: u8,
    pub door_obstruction: u8,
    pub overload: u8,
    pub emergency_stop: u8,
    pub individual_service_mode: u8,
    pub emergency_mode: u8,
    pub safety_system: u8,
}

/// Pack a floor label into its fixed-size NUL-terminated field.
pub fn pack_label(floor: Floor) -> [u8; LABEL_BYTES] {
    let mut out = [0u8; LABEL_BYTES];
    let text = floor.to_string();
    out[..text.len()].copy_from_slice(text.as_bytes());
    out
}

/// Parse a fixed-size label field back into a floor.
///
/// Fails when the field is not NUL-terminated within bounds or does not
/// hold a canonical label.
pub fn parse_label(raw: &[u8; LABEL_BYTES]) -> Result<Floor, FloorError> {
    let len = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(FloorError::TooLong)?;
    let text = std::str::from_utf8(&raw[..len]).map_err(|_| FloorError::NotANumber)?;
    Floor::parse(text)
}

/// Check that a car name is usable as a segment name component.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Segment name for a car, as passed to shm_open.
pub fn segment_name(car: &str) -> String {
    format!("/car{}", car)
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// Handle on a mapped cab record.
///
/// The creating process (the car) owns the segment and unlinks it on
/// drop; attaching processes only unmap.
pub struct SharedCab {
    ptr: *mut CabRecord,
    segment: String,
    owner: bool,
}

// SAFETY: the record is only ever touched through CabGuard, which holds
// the process-shared mutex embedded in the segment.
unsafe impl Send for SharedCab {}
unsafe impl Sync for SharedCab {}

impl SharedCab {
    /// Create the segment for `car`, replacing a stale one left behind by
    /// a crashed run, and initialise the record: doors closed, both floor
    /// fields at `lowest`, all flags clear, heartbeat uninitialised.
    pub fn create(car: &str, lowest: Floor, highest: Floor) -> Result<SharedCab, ShmError> {
        if !valid_name(car) {
            return Err(ShmError::BadName);
        }
        let segment = segment_name(car);
        let cname = CString::new(segment.clone()).map_err(|_| ShmError::BadName)?;

        let mut fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 && last_os_error().raw_os_error() == Some(libc::EEXIST) {
            log::warn!("replacing stale segment {}", segment);
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::mode_t,
                )
            };
        }
        if fd < 0 {
            return Err(ShmError::Open {
                name: segment,
                err: last_os_error(),
            });
        }

        let size = std::mem::size_of::<CabRecord>();
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(ShmError::Resize { name: segment, err });
        }

        let ptr = map_record(fd, &segment)?;
        let cab = SharedCab {
            ptr,
            segment,
            owner: true,
        };

        unsafe {
            cab.init_sync()?;
            let rec = &mut *cab.ptr;
            rec.current_floor = pack_label(lowest);
            rec.destination_floor = pack_label(lowest);
            rec.lowest_floor = pack_label(lowest);
            rec.highest_floor = pack_label(highest);
            rec.status = CabStatus::Closed as u8;
            rec.open_button = 0;
            rec.close_button = 0;
            rec.door_obstruction = 0;
            rec.overload = 0;
            rec.emergency_stop = 0;
            rec.individual_service_mode = 0;
            rec.emergency_mode = 0;
            rec.safety_system = 0;
        }
        Ok(cab)
    }

    /// Attach to the segment of a running car.
    pub fn open(car: &str) -> Result<SharedCab, ShmError> {
        if !valid_name(car) {
            return Err(ShmError::BadName);
        }
        let segment = segment_name(car);
        let cname = CString::new(segment.clone()).map_err(|_| ShmError::BadName)?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::Open {
                name: segment,
                err: last_os_error(),
            });
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::Open { name: segment, err });
        }
        if (stat.st_size as usize) < std::mem::size_of::<CabRecord>() {
            unsafe { libc::close(fd) };
            return Err(ShmError::WrongSize { name: segment });
        }

        let ptr = map_record(fd, &segment)?;
        Ok(SharedCab {
            ptr,
            segment,
            owner: false,
        })
    }

    /// Initialise the embedded mutex and condition variable as
    /// process-shared, with the condvar on the monotonic clock.
    unsafe fn init_sync(&self) -> Result<(), ShmError> {
        let rec = &mut *self.ptr;

        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut rc = libc::pthread_mutexattr_init(&mut mattr);
        if rc == 0 {
            libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
            rc = libc::pthread_mutex_init(&mut rec.mutex, &mattr);
            libc::pthread_mutexattr_destroy(&mut mattr);
        }
        if rc != 0 {
            return Err(ShmError::Sync {
                err: io::Error::from_raw_os_error(rc),
            });
        }

        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        rc = libc::pthread_condattr_init(&mut cattr);
        if rc == 0 {
            libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_condattr_setclock(&mut cattr, libc::CLOCK_MONOTONIC);
            rc = libc::pthread_cond_init(&mut rec.cond, &cattr);
            libc::pthread_condattr_destroy(&mut cattr);
        }
        if rc != 0 {
            return Err(ShmError::Sync {
                err: io::Error::from_raw_os_error(rc),
            });
        }
        Ok(())
    }

    /// Segment name, for diagnostics.
    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Lock the record. Blocks until the in-segment mutex is acquired.
    pub fn lock(&self) -> CabGuard<'_> {
        unsafe {
            libc::pthread_mutex_lock(&mut (*self.ptr).mutex);
        }
        CabGuard { cab: self }
    }
}

impl Drop for SharedCab {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, std::mem::size_of::<CabRecord>());
            if self.owner {
                if let Ok(cname) = CString::new(self.segment.clone()) {
                    libc::shm_unlink(cname.as_ptr());
                }
            }
        }
    }
}

fn map_record(fd: libc::c_int, segment: &str) -> Result<*mut CabRecord, ShmError> {
    let size = std::mem::size_of::<CabRecord>();
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let err = last_os_error();
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Map {
            name: segment.to_string(),
            err,
        });
    }
    Ok(ptr as *mut CabRecord)
}

/// Exclusive view of a locked cab record. Unlocks on drop.
pub struct CabGuard<'a> {
    cab: &'a SharedCab,
}

impl CabGuard<'_> {
    fn record(&self) -> &CabRecord {
        unsafe { &*self.cab.ptr }
    }

    fn record_mut(&mut self) -> &mut CabRecord {
        unsafe { &mut *self.cab.ptr }
    }

    /// Raw record access, for invariant validation.
    pub fn raw(&self) -> &CabRecord {
        self.record()
    }

    pub fn current_floor(&self) -> Result<Floor, FloorError> {
        parse_label(&self.record().current_floor)
    }

    pub fn set_current_floor(&mut self, floor: Floor) {
        self.record_mut().current_floor = pack_label(floor);
    }

    pub fn destination_floor(&self) -> Result<Floor, FloorError> {
        parse_label(&self.record().destination_floor)
    }

    pub fn set_destination_floor(&mut self, floor: Floor) {
        self.record_mut().destination_floor = pack_label(floor);
    }

    pub fn lowest_floor(&self) -> Result<Floor, FloorError> {
        parse_label(&self.record().lowest_floor)
    }

    pub fn highest_floor(&self) -> Result<Floor, FloorError> {
        parse_label(&self.record().highest_floor)
    }

    pub fn status(&self) -> Option<CabStatus> {
        CabStatus::from_u8(self.record().status)
    }

    pub fn set_status(&mut self, status: CabStatus) {
        self.record_mut().status = status as u8;
    }

    pub fn open_button(&self) -> bool {
        self.record().open_button != 0
    }

    pub fn set_open_button(&mut self, on: bool) {
        self.record_mut().open_button = on as u8;
    }

    pub fn close_button(&self) -> bool {
        self.record().close_button != 0
    }

    pub fn set_close_button(&mut self, on: bool) {
        self.record_mut().close_button = on as u8;
    }

    pub fn door_obstruction(&self) -> bool {
        self.record().door_obstruction != 0
    }

    pub fn set_door_obstruction(&mut self, on: bool) {
        self.record_mut().door_obstruction = on as u8;
    }

    pub fn overload(&self) -> bool {
        self.record().overload != 0
    }

    pub fn set_overload(&mut self, on: bool) {
        self.record_mut().overload = on as u8;
    }

    pub fn emergency_stop(&self) -> bool {
        self.record().emergency_stop != 0
    }

    pub fn set_emergency_stop(&mut self, on: bool) {
        self.record_mut().emergency_stop = on as u8;
    }

    pub fn individual_service_mode(&self) -> bool {
        self.record().individual_service_mode != 0
    }

    pub fn set_individual_service_mode(&mut self, on: bool) {
        self.record_mut().individual_service_mode = on as u8;
    }

    pub fn emergency_mode(&self) -> bool {
        self.record().emergency_mode != 0
    }

    pub fn set_emergency_mode(&mut self, on: bool) {
        self.record_mut().emergency_mode = on as u8;
    }

    pub fn safety_system(&self) -> u8 {
        self.record().safety_system
    }

    pub fn set_safety_system(&mut self, value: u8) {
        self.record_mut().safety_system = value;
    }

    /// Wake every process waiting on the record.
    pub fn notify_all(&mut self) {
        unsafe {
            libc::pthread_cond_broadcast(&mut self.record_mut().cond);
        }
    }

    /// Timed wait on the condition variable. The mutex is released for
    /// the duration of the wait and reacquired before returning. Returns
    /// true when the wait timed out.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
        }
        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000),
            tv_nsec: nanos % 1_000_000_000,
        };
        let rec = self.record_mut();
        let rc = unsafe {
            libc::pthread_cond_timedwait(&mut rec.cond, &mut rec.mutex, &deadline)
        };
        rc == libc::ETIMEDOUT
    }
}

impl Drop for CabGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(&mut (*self.cab.ptr).mutex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor(label: &str) -> Floor {
        Floor::parse(label).unwrap()
    }

    #[test]
    fn test_status_byte_round_trip() {
        for status in [
            CabStatus::Opening,
            CabStatus::Open,
            CabStatus::Closing,
            CabStatus::Closed,
            CabStatus::Between,
        ] {
            assert_eq!(CabStatus::from_u8(status as u8), Some(status));
            assert_eq!(status.as_str().parse::<CabStatus>(), Ok(status));
        }
        assert_eq!(CabStatus::from_u8(5), None);
        assert!("ajar".parse::<CabStatus>().is_err());
    }

    #[test]
    fn test_label_pack_parse() {
        for label in ["1", "42", "999", "B1", "B99"] {
            let packed = pack_label(floor(label));
            assert_eq!(parse_label(&packed).unwrap(), floor(label));
        }
        // Not NUL-terminated within the field.
        assert!(parse_label(&[b'9', b'9', b'9', b'9']).is_err());
        // NUL-terminated but not a label.
        assert!(parse_label(&[b'x', 0, 0, 0]).is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(valid_name("A"));
        assert!(valid_name("Car9"));
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name("slash/y"));
        assert!(!valid_name(&"x".repeat(NAME_MAX + 1)));
    }

    #[test]
    fn test_create_open_round_trip() {
        // Segment names are per-test-process, so parallel test runs do
        // not collide.
        let name = format!("t{}", std::process::id());
        let owner = SharedCab::create(&name, floor("B2"), floor("9")).unwrap();
        {
            let mut guard = owner.lock();
            assert_eq!(guard.status(), Some(CabStatus::Closed));
            assert_eq!(guard.current_floor().unwrap(), floor("B2"));
            assert_eq!(guard.safety_system(), 0);
            guard.set_status(CabStatus::Opening);
            guard.set_open_button(true);
            guard.notify_all();
        }

        let attached = SharedCab::open(&name).unwrap();
        {
            let mut guard = attached.lock();
            assert_eq!(guard.status(), Some(CabStatus::Opening));
            assert!(guard.open_button());
            assert_eq!(guard.highest_floor().unwrap(), floor("9"));
            guard.set_open_button(false);
        }

        let guard = owner.lock();
        assert!(!guard.open_button());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let name = format!("w{}", std::process::id());
        let cab = SharedCab::create(&name, floor("1"), floor("5")).unwrap();
        let mut guard = cab.lock();
        assert!(guard.wait_timeout(Duration::from_millis(10)));
    }
}
