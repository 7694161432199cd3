//! Persist timestamp records
//!
//! A successful authentication under a `persist` rule leaves an empty,
//! root-owned, mode-0 file named after the login session (see
//! [`SessionKey`]). The file carries no content. Its access time holds the
//! boot-relative clock and its modification time holds the wall clock, each
//! set to "now + window" when the record is armed.
//!
//! A record is only honoured while both stamps lie in `[now, now + window]`
//! on their own clock. Moving the wall clock (or forging one field) cannot
//! extend the window, because the other clock must agree. Any record that
//! fails a check is deleted.
//!
//! There is no locking: two invocations in the same session may race
//! between checking, deleting and re-creating a record.

use crate::error::{DoasError, Result};
use crate::procinfo::SessionKey;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use nix::unistd::getgid;
use std::fs::{self, DirBuilder, File, FileTimes, Metadata};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[cfg(any(target_os = "linux", target_os = "android"))]
const BOOT_CLOCK: ClockId = ClockId::CLOCK_BOOTTIME;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const BOOT_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

/// Outcome of looking up the record for this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampState {
    /// No usable record; the principal must authenticate
    Absent,
    /// The principal authenticated within the window
    Valid,
}

/// Result of checking an existing record. `Invalid` records are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Valid,
    Invalid(&'static str),
}

enum RecordLookup {
    Found(Metadata),
    NotFound,
}

/// Ownership a record must carry to be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordOwner {
    uid: u32,
    gid: u32,
}

/// Readings of both clocks at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamps {
    boot: TimeSpec,
    real: TimeSpec,
}

impl Stamps {
    fn now() -> Result<Self> {
        Ok(Self {
            boot: clock_gettime(BOOT_CLOCK)?,
            real: clock_gettime(ClockId::CLOCK_REALTIME)?,
        })
    }

    fn of(meta: &Metadata) -> Self {
        Self {
            boot: TimeSpec::new(meta.atime(), meta.atime_nsec() as _),
            real: TimeSpec::new(meta.mtime(), meta.mtime_nsec() as _),
        }
    }

    /// Both readings moved `window` ahead. Fails rather than wrapping.
    fn plus(self, window: Duration) -> Result<Self> {
        Ok(Self {
            boot: advance(self.boot, window)?,
            real: advance(self.real, window)?,
        })
    }

    fn is_armed(&self) -> bool {
        is_set(self.boot) && is_set(self.real)
    }
}

fn advance(ts: TimeSpec, by: Duration) -> Result<TimeSpec> {
    let overflow = || DoasError::Timestamp(format!("window of {:?} is out of range", by));
    let by_secs = i64::try_from(by.as_secs()).map_err(|_| overflow())?;

    let mut secs = i64::from(ts.tv_sec()).checked_add(by_secs).ok_or_else(overflow)?;
    let mut nanos = i64::from(ts.tv_nsec()) + i64::from(by.subsec_nanos());
    if nanos >= 1_000_000_000 {
        nanos -= 1_000_000_000;
        secs = secs.checked_add(1).ok_or_else(overflow)?;
    }
    Ok(TimeSpec::new(secs as _, nanos as _))
}

fn is_set(ts: TimeSpec) -> bool {
    ts.tv_sec() != 0 || ts.tv_nsec() != 0
}

fn to_system_time(ts: TimeSpec) -> Result<SystemTime> {
    let secs = u64::try_from(ts.tv_sec())
        .map_err(|_| DoasError::Timestamp("clock reading before epoch".to_string()))?;
    Ok(UNIX_EPOCH + Duration::new(secs, ts.tv_nsec() as u32))
}

/// The "recently authenticated" cache for one persist window.
#[derive(Debug, Clone)]
pub struct TimestampCache {
    dir: PathBuf,
    window: Duration,
    owner: RecordOwner,
}

impl TimestampCache {
    /// Records in `dir` are trusted when owned by root and the invoker's
    /// primary group.
    pub fn new(dir: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            dir: dir.into(),
            window,
            owner: RecordOwner {
                uid: 0,
                gid: getgid().as_raw(),
            },
        }
    }

    pub fn record_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(key.to_string())
    }

    /// Check the record of the current login session.
    pub fn open(&self) -> Result<TimestampState> {
        self.open_for(&SessionKey::current()?)
    }

    /// Arm the record of the current login session. Call only right after a
    /// successful authentication.
    pub fn set_after_auth(&self) -> Result<()> {
        self.set_after_auth_for(&SessionKey::current()?)
    }

    /// Remove the record of the current login session.
    pub fn clear(&self) -> Result<()> {
        self.clear_for(&SessionKey::current()?)
    }

    pub fn open_for(&self, key: &SessionKey) -> Result<TimestampState> {
        self.ensure_dir()?;
        let path = self.record_path(key);

        let meta = match lookup(&path)? {
            RecordLookup::NotFound => {
                debug!("No timestamp record at {}", path.display());
                return Ok(TimestampState::Absent);
            }
            RecordLookup::Found(meta) => meta,
        };

        match self.verdict(&meta)? {
            Verdict::Valid => {
                debug!("Timestamp record {} is valid", path.display());
                Ok(TimestampState::Valid)
            }
            Verdict::Invalid(reason) => {
                debug!("Removing timestamp record {}: {}", path.display(), reason);
                remove_record(&path)?;
                Ok(TimestampState::Absent)
            }
        }
    }

    pub fn set_after_auth_for(&self, key: &SessionKey) -> Result<()> {
        self.ensure_dir()?;
        let path = self.record_path(key);

        // a stale record is replaced rather than reopened through its old mode
        remove_record(&path)?;

        let file = File::options()
            .write(true)
            .create_new(true)
            .mode(0)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|e| DoasError::Timestamp(format!("create {}: {}", path.display(), e)))?;

        let expiry = Stamps::now()?.plus(self.window)?;
        let times = FileTimes::new()
            .set_accessed(to_system_time(expiry.boot)?)
            .set_modified(to_system_time(expiry.real)?);
        file.set_times(times)
            .map_err(|e| DoasError::Timestamp(format!("stamp {}: {}", path.display(), e)))?;

        debug!("Armed timestamp record {} for {:?}", path.display(), self.window);
        Ok(())
    }

    pub fn clear_for(&self, key: &SessionKey) -> Result<()> {
        remove_record(&self.record_path(key))
    }

    fn verdict(&self, meta: &Metadata) -> Result<Verdict> {
        if !meta.file_type().is_file() {
            return Ok(Verdict::Invalid("not a regular file"));
        }
        if meta.uid() != self.owner.uid || meta.gid() != self.owner.gid {
            return Ok(Verdict::Invalid("wrong owner"));
        }
        if meta.mode() & 0o7777 != 0 {
            return Ok(Verdict::Invalid("permission bits set"));
        }

        let stored = Stamps::of(meta);
        if !stored.is_armed() {
            return Ok(Verdict::Invalid("never armed"));
        }

        let lower = Stamps::now()?;
        let upper = lower.plus(self.window)?;

        let boot_ok = lower.boot <= stored.boot && stored.boot <= upper.boot;
        let real_ok = lower.real <= stored.real && stored.real <= upper.real;

        Ok(match (boot_ok, real_ok) {
            (true, true) => Verdict::Valid,
            (false, true) => Verdict::Invalid("boot clock stamp out of range"),
            (true, false) => Verdict::Invalid("wall clock stamp out of range"),
            (false, false) => Verdict::Invalid("expired"),
        })
    }

    /// Create the record directory if needed and refuse one that others
    /// could write to.
    fn ensure_dir(&self) -> Result<()> {
        match DirBuilder::new().mode(0o711).create(&self.dir) {
            Ok(()) => debug!("Created {}", self.dir.display()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(DoasError::Timestamp(format!(
                    "create {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        }

        let meta = fs::symlink_metadata(&self.dir)?;
        if !meta.is_dir() {
            return Err(DoasError::Timestamp(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        if meta.uid() != self.owner.uid || meta.mode() & 0o022 != 0 {
            warn!("Ignoring insecure timestamp directory {}", self.dir.display());
            return Err(DoasError::Timestamp(format!(
                "{} has unsafe ownership or permissions",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

fn lookup(path: &Path) -> Result<RecordLookup> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(RecordLookup::Found(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(RecordLookup::NotFound),
        Err(e) => Err(DoasError::Timestamp(format!("stat {}: {}", path.display(), e))),
    }
}

fn remove_record(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DoasError::Timestamp(format!("remove {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getuid;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{tempdir, TempDir};

    const WINDOW: Duration = Duration::from_secs(300);

    fn key() -> SessionKey {
        SessionKey {
            ppid: 4200,
            sid: 4242,
            tty_nr: 34816,
            start_time: 123456,
            uid: getuid().as_raw(),
        }
    }

    /// A cache that trusts records owned by the test user instead of root
    fn cache() -> (TempDir, TimestampCache) {
        let dir = tempdir().unwrap();
        let mut cache = TimestampCache::new(dir.path().join("doas"), WINDOW);
        cache.owner = RecordOwner {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        };
        (dir, cache)
    }

    fn write_record(path: &Path, stamps: Stamps, mode: u32) {
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let times = FileTimes::new()
            .set_accessed(to_system_time(stamps.boot).unwrap())
            .set_modified(to_system_time(stamps.real).unwrap());
        file.set_times(times).unwrap();
        drop(file);
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn secs(n: i64) -> TimeSpec {
        TimeSpec::new(n, 0)
    }

    fn prepare(cache: &TimestampCache) -> PathBuf {
        cache.ensure_dir().unwrap();
        cache.record_path(&key())
    }

    #[test]
    fn test_set_then_open_is_valid() {
        let (_dir, cache) = cache();
        cache.set_after_auth_for(&key()).unwrap();

        let meta = fs::symlink_metadata(cache.record_path(&key())).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.mode() & 0o7777, 0);
        assert_eq!(meta.len(), 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Valid);
    }

    #[test]
    fn test_absent_when_no_record() {
        let (_dir, cache) = cache();
        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
    }

    #[test]
    fn test_record_is_per_session() {
        let (_dir, cache) = cache();
        cache.set_after_auth_for(&key()).unwrap();

        let other = SessionKey {
            tty_nr: 34817,
            ..key()
        };
        assert_eq!(cache.open_for(&other).unwrap(), TimestampState::Absent);
        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Valid);
    }

    #[test]
    fn test_valid_within_window_on_both_clocks() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        write_record(&path, now.plus(Duration::from_secs(100)).unwrap(), 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Valid);
        assert!(path.exists());
    }

    #[test]
    fn test_expired_after_window_elapses() {
        // armed at now+300 a little over 300 seconds ago
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        let stale = Stamps {
            boot: now.boot - secs(1),
            real: now.real - secs(1),
        };
        write_record(&path, stale, 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_wall_clock_alone_is_not_enough() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        let forged = Stamps {
            boot: now.boot - secs(10),
            real: now.real + secs(100),
        };
        write_record(&path, forged, 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_boot_clock_alone_is_not_enough() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        let forged = Stamps {
            boot: now.boot + secs(100),
            real: now.real + secs(WINDOW.as_secs() as i64 + 3600),
        };
        write_record(&path, forged, 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_unarmed_record_removed() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        write_record(&path, Stamps { boot: secs(0), real: secs(0) }, 0);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_permission_bits_invalidate() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        write_record(&path, now.plus(Duration::from_secs(100)).unwrap(), 0o400);

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_owner_invalidates() {
        let (_dir, mut cache) = cache();
        let path = prepare(&cache);
        let now = Stamps::now().unwrap();
        write_record(&path, now.plus(Duration::from_secs(100)).unwrap(), 0);

        cache.owner.gid = cache.owner.gid.wrapping_add(1);
        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(!path.exists());
    }

    #[test]
    fn test_symlink_record_invalidates() {
        let (dir, cache) = cache();
        let path = prepare(&cache);
        let target = dir.path().join("elsewhere");
        let now = Stamps::now().unwrap();
        write_record(&target, now.plus(Duration::from_secs(100)).unwrap(), 0);
        std::os::unix::fs::symlink(&target, &path).unwrap();

        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Absent);
        assert!(fs::symlink_metadata(&path).is_err());
        assert!(target.exists());
    }

    #[test]
    fn test_clear() {
        let (_dir, cache) = cache();
        cache.set_after_auth_for(&key()).unwrap();
        cache.clear_for(&key()).unwrap();
        assert!(!cache.record_path(&key()).exists());

        // clearing a missing record is fine
        cache.clear_for(&key()).unwrap();
    }

    #[test]
    fn test_rearm_replaces_stale_record() {
        let (_dir, cache) = cache();
        let path = prepare(&cache);
        write_record(&path, Stamps { boot: secs(0), real: secs(0) }, 0o644);

        cache.set_after_auth_for(&key()).unwrap();
        assert_eq!(cache.open_for(&key()).unwrap(), TimestampState::Valid);
    }

    #[test]
    fn test_directory_created_without_group_write() {
        let (_dir, cache) = cache();
        assert!(!cache.dir.exists());
        cache.open_for(&key()).unwrap();

        let meta = fs::metadata(&cache.dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode() & 0o022, 0);
    }

    #[test]
    fn test_writable_directory_refused() {
        let (_dir, cache) = cache();
        fs::create_dir(&cache.dir).unwrap();
        fs::set_permissions(&cache.dir, fs::Permissions::from_mode(0o777)).unwrap();

        assert!(matches!(cache.open_for(&key()), Err(DoasError::Timestamp(_))));
        assert!(matches!(cache.set_after_auth_for(&key()), Err(DoasError::Timestamp(_))));
    }

    #[test]
    fn test_advance_carries_nanoseconds() {
        let ts = TimeSpec::new(10, 900_000_000);
        let moved = advance(ts, Duration::new(5, 200_000_000)).unwrap();
        assert_eq!(moved, TimeSpec::new(16, 100_000_000));
    }

    #[test]
    fn test_oversized_window_is_an_error() {
        let now = Stamps::now().unwrap();
        assert!(now.plus(Duration::from_secs(20_000_000_000)).is_ok());
        assert!(matches!(now.plus(Duration::MAX), Err(DoasError::Timestamp(_))));

        let (dir, _) = cache();
        let mut huge = TimestampCache::new(dir.path().join("doas"), Duration::MAX);
        huge.owner = RecordOwner {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        };
        assert!(matches!(huge.set_after_auth_for(&key()), Err(DoasError::Timestamp(_))));
    }
}
