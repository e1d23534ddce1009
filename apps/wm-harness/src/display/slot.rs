use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplaySlot(u32);

impl DisplaySlot {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// Addressable display name, e.g. `:7`.
    pub fn name(&self) -> String {
        format!(":{}", self.0)
    }

    /// Lock file an X server creates while it owns this display.
    pub fn lock_marker(&self, lock_dir: &Path) -> PathBuf {
        lock_dir.join(format!(".X{}-lock", self.0))
    }

    pub fn reservation_marker(&self, lock_dir: &Path) -> PathBuf {
        lock_dir.join(format!(".wm-harness-{}.lock", self.0))
    }

    pub fn x11_socket(&self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(format!("X{}", self.0))
    }
}

impl fmt::Display for DisplaySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl FromStr for DisplaySlot {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix(':').unwrap_or(trimmed);
        let digits = digits.split('.').next().unwrap_or(digits);
        digits
            .parse::<u32>()
            .map(DisplaySlot)
            .map_err(|_| HarnessError::Config(format!("invalid display '{s}'")))
    }
}

/// Picks display numbers by looking at the lock directory.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    lock_dir: PathBuf,
    min: u32,
    max: u32,
}

impl SlotAllocator {
    pub fn new(lock_dir: impl Into<PathBuf>, min: u32, max: u32) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            min,
            max,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(&config.lock_dir, config.min_display, config.max_display)
    }

    /// First slot without an X lock marker. Advisory only: nothing is held,
    /// so a concurrent scan can return the same slot.
    pub fn scan(&self) -> HarnessResult<DisplaySlot> {
        (self.min..=self.max)
            .map(DisplaySlot)
            .find(|slot| !slot.lock_marker(&self.lock_dir).exists())
            .ok_or(HarnessError::NoFreeDisplay {
                min: self.min,
                max: self.max,
            })
    }

    /// First slot without an X lock marker whose reservation marker this
    /// call managed to lock exclusively.
    pub fn reserve(&self) -> HarnessResult<SlotReservation> {
        for number in self.min..=self.max {
            let slot = DisplaySlot(number);
            if slot.lock_marker(&self.lock_dir).exists() {
                continue;
            }
            if let Some(reservation) = self.try_reserve(slot)? {
                debug!(
                    target: "wm_harness::display",
                    display = %slot,
                    marker = %reservation.marker.display(),
                    "display slot reserved"
                );
                return Ok(reservation);
            }
        }
        Err(HarnessError::NoFreeDisplay {
            min: self.min,
            max: self.max,
        })
    }

    fn try_reserve(&self, slot: DisplaySlot) -> io::Result<Option<SlotReservation>> {
        let marker = slot.reservation_marker(&self.lock_dir);
        // A holder may unlink its marker between our open and our lock, so
        // retry a bounded number of times against the fresh path.
        for _ in 0..MARKER_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&marker)?;
            if !try_lock_exclusive(&file)? {
                return Ok(None);
            }
            if !is_same_file(&file, &marker)? {
                continue;
            }

            let mut previous = String::new();
            file.read_to_string(&mut previous)?;
            if !previous.trim().is_empty() {
                debug!(
                    target: "wm_harness::display",
                    marker = %marker.display(),
                    previous_owner = previous.trim(),
                    "reclaiming stale reservation"
                );
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", process::id())?;
            return Ok(Some(SlotReservation {
                slot,
                marker,
                lock: file,
                released: false,
            }));
        }
        Ok(None)
    }
}

const MARKER_ATTEMPTS: usize = 4;

/// Non-blocking exclusive `flock`. The kernel drops the lock when its owner
/// exits, which is what makes an abandoned marker reclaimable.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    loop {
        // SAFETY: the descriptor is owned by `file` and open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err),
        }
    }
}

/// Whether `path` still names the inode behind `file`.
fn is_same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Exclusive claim on a display slot for the lifetime of a harness session.
/// The marker stays `flock`ed until the reservation is released or dropped.
#[derive(Debug)]
pub struct SlotReservation {
    slot: DisplaySlot,
    marker: PathBuf,
    lock: File,
    released: bool,
}

impl SlotReservation {
    pub fn slot(&self) -> DisplaySlot {
        self.slot
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn release(mut self) -> io::Result<()> {
        self.remove_marker()
    }

    fn remove_marker(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // Unlink while still holding the lock; a racing allocator that opened
        // the old inode sees the path moved on and retries.
        let removed = match fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        // SAFETY: the descriptor is owned by `self.lock`.
        unsafe { libc::flock(self.lock.as_raw_fd(), libc::LOCK_UN) };
        removed
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if let Err(err) = self.remove_marker() {
            warn!(
                target: "wm_harness::display",
                marker = %self.marker.display(),
                error = %err,
                "failed to remove reservation marker"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_derives_names_and_paths() {
        let slot = DisplaySlot::new(7);
        assert_eq!(slot.name(), ":7");
        assert_eq!(slot.to_string(), ":7");
        assert_eq!(slot.lock_marker(Path::new("/tmp")), PathBuf::from("/tmp/.X7-lock"));
        assert_eq!(
            slot.x11_socket(Path::new("/tmp/.X11-unix")),
            PathBuf::from("/tmp/.X11-unix/X7")
        );
    }

    #[test]
    fn parses_display_names() {
        assert_eq!(":12".parse::<DisplaySlot>().unwrap(), DisplaySlot::new(12));
        assert_eq!("3".parse::<DisplaySlot>().unwrap(), DisplaySlot::new(3));
        assert_eq!(":4.0".parse::<DisplaySlot>().unwrap(), DisplaySlot::new(4));
        assert!(":x".parse::<DisplaySlot>().is_err());
    }

    #[test]
    fn scan_skips_locked_slots() {
        let dir = tempfile::tempdir().unwrap();
        for n in 1..=6 {
            fs::write(dir.path().join(format!(".X{n}-lock")), "").unwrap();
        }
        let allocator = SlotAllocator::new(dir.path(), 1, 100);
        assert_eq!(allocator.scan().unwrap(), DisplaySlot::new(7));
    }

    #[test]
    fn scan_reports_exhausted_range() {
        let dir = tempfile::tempdir().unwrap();
        for n in 1..=3 {
            fs::write(dir.path().join(format!(".X{n}-lock")), "").unwrap();
        }
        let allocator = SlotAllocator::new(dir.path(), 1, 3);
        assert!(matches!(
            allocator.scan(),
            Err(HarnessError::NoFreeDisplay { min: 1, max: 3 })
        ));
    }

    #[test]
    fn reservations_are_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = SlotAllocator::new(dir.path(), 1, 100);

        let first = allocator.reserve().unwrap();
        let second = allocator.reserve().unwrap();
        assert_eq!(first.slot(), DisplaySlot::new(1));
        assert_eq!(second.slot(), DisplaySlot::new(2));

        let contents = fs::read_to_string(first.marker()).unwrap();
        assert_eq!(contents.trim(), process::id().to_string());

        first.release().unwrap();
        let third = allocator.reserve().unwrap();
        assert_eq!(third.slot(), DisplaySlot::new(1));
        drop(second);
        drop(third);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn stale_reservation_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = DisplaySlot::new(1).reservation_marker(dir.path());
        fs::write(&marker, format!("{}\n", dead_pid())).unwrap();

        let allocator = SlotAllocator::new(dir.path(), 1, 100);
        let reservation = allocator.reserve().unwrap();
        assert_eq!(reservation.slot(), DisplaySlot::new(1));
        let contents = fs::read_to_string(&marker).unwrap();
        assert_eq!(contents.trim(), process::id().to_string());
    }

    #[test]
    fn live_foreign_reservation_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let marker = DisplaySlot::new(1).reservation_marker(dir.path());
        fs::write(&marker, "4242\n").unwrap();
        let holder = File::open(&marker).unwrap();
        assert!(try_lock_exclusive(&holder).unwrap());

        let allocator = SlotAllocator::new(dir.path(), 1, 100);
        assert_eq!(allocator.reserve().unwrap().slot(), DisplaySlot::new(2));
        assert_eq!(fs::read_to_string(&marker).unwrap(), "4242\n");
    }

    #[test]
    fn racing_reclaims_of_a_stale_marker_yield_one_owner() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let marker = DisplaySlot::new(1).reservation_marker(dir.path());
        let dead = dead_pid();

        for round in 0..200 {
            fs::write(&marker, format!("{dead}\n")).unwrap();
            let barrier = Arc::new(Barrier::new(2));
            let results: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let allocator = SlotAllocator::new(dir.path(), 1, 1);
                    thread::spawn(move || {
                        barrier.wait();
                        allocator.reserve()
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect();

            let owners: Vec<&SlotReservation> =
                results.iter().filter_map(|result| result.as_ref().ok()).collect();
            assert_eq!(owners.len(), 1, "round {round}: {results:?}");
            assert!(results.iter().any(|result| matches!(
                result,
                Err(HarnessError::NoFreeDisplay { min: 1, max: 1 })
            )));
            assert!(is_same_file(&owners[0].lock, &marker).unwrap());
            drop(results);
            assert!(!marker.exists(), "round {round}: marker outlived its owner");
        }
    }

    #[test]
    fn released_marker_cannot_be_claimed_through_old_handle() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = SlotAllocator::new(dir.path(), 1, 1);
        let marker = DisplaySlot::new(1).reservation_marker(dir.path());

        let first = allocator.reserve().unwrap();
        let old_handle = File::open(&marker).unwrap();
        first.release().unwrap();
        let second = allocator.reserve().unwrap();

        // The old inode is unlocked now, but it no longer backs the path.
        assert!(try_lock_exclusive(&old_handle).unwrap());
        assert!(!is_same_file(&old_handle, &marker).unwrap());
        assert!(is_same_file(&second.lock, &marker).unwrap());
    }
}
