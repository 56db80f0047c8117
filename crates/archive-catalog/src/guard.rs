//! Per-user exclusivity guard.
//!
//! One live process per profile: the lock marker is opened and locked
//! exclusively through the OS (`fs2`), so a holder that dies loses the lock
//! even if its marker file stays behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::GuardError;

/// Fixed subdirectory of a user's profile.
pub const PROFILE_SUBDIR: &str = "ARCHIV_USER";
/// Shared default configuration, directly under the profile root.
pub const DEFAULT_CONFIG_FILE: &str = "DefaultConfig.ini";
/// Per-user configuration seeded from the shared default.
pub const USER_CONFIG_FILE: &str = "Config.ini";

/// How many times an acquire retries when the marker is swapped under it.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Filesystem layout of one user's profile.
///
/// ```text
/// <root>/DefaultConfig.ini
/// <root>/<user>/ARCHIV_USER/Config.ini
/// <root>/<user>/ARCHIV_USER/<user>.lock
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLayout {
    root: PathBuf,
    user: String,
}

impl ProfileLayout {
    pub fn new(root: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            user: user.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.root.join(&self.user).join(PROFILE_SUBDIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.profile_dir().join(format!("{}.lock", self.user))
    }

    pub fn config_path(&self) -> PathBuf {
        self.profile_dir().join(USER_CONFIG_FILE)
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.root.join(DEFAULT_CONFIG_FILE)
    }
}

/// What `bootstrap` did with the user's config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeed {
    /// Copied from the shared default
    Seeded,
    /// The user already had one; left untouched
    AlreadyPresent,
    /// No shared default exists; nothing copied
    NoDefault,
}

/// Lifecycle of a guard. `Released` is terminal.
#[derive(Debug)]
enum GuardState {
    Unacquired,
    Held { file: File },
    Released,
}

/// Exclusive occupancy of one user profile.
///
/// Dropping a held guard releases it, so every exit path of the owning
/// scope gives the profile back.
#[derive(Debug)]
pub struct SessionGuard {
    layout: ProfileLayout,
    state: GuardState,
}

impl SessionGuard {
    pub fn new(layout: ProfileLayout) -> Self {
        Self {
            layout,
            state: GuardState::Unacquired,
        }
    }

    pub fn layout(&self) -> &ProfileLayout {
        &self.layout
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, GuardState::Held { .. })
    }

    /// Create the profile directory and seed its config if missing.
    ///
    /// An existing user config is never overwritten.
    pub fn bootstrap(&self) -> Result<ConfigSeed, GuardError> {
        let profile_dir = self.layout.profile_dir();
        fs::create_dir_all(&profile_dir).map_err(|e| GuardError::io(&profile_dir, e))?;

        let user_config = self.layout.config_path();
        if user_config.exists() {
            return Ok(ConfigSeed::AlreadyPresent);
        }

        let default_config = self.layout.default_config_path();
        let mut source = match File::open(&default_config) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "No shared config at {}, profile left without one",
                    default_config.display()
                );
                return Ok(ConfigSeed::NoDefault);
            }
            Err(e) => return Err(GuardError::io(&default_config, e)),
        };

        // create_new: a config that appears concurrently wins over the copy.
        let mut target = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&user_config)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Ok(ConfigSeed::AlreadyPresent);
            }
            Err(e) => return Err(GuardError::io(&user_config, e)),
        };

        if let Err(e) = io::copy(&mut source, &mut target).and_then(|_| target.sync_all()) {
            drop(target);
            let _ = fs::remove_file(&user_config);
            return Err(GuardError::io(&user_config, e));
        }

        info!(
            "Seeded {} from {}",
            user_config.display(),
            default_config.display()
        );
        Ok(ConfigSeed::Seeded)
    }

    /// Take exclusive occupancy of the profile.
    ///
    /// Fails with `AlreadyRunning` when another live session holds the
    /// marker. Never waits. Acquiring an already held guard is a no-op.
    pub fn acquire(&mut self) -> Result<(), GuardError> {
        match self.state {
            GuardState::Held { .. } => return Ok(()),
            GuardState::Released => return Err(GuardError::Released),
            GuardState::Unacquired => {}
        }

        let lock_path = self.layout.lock_path();
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| GuardError::io(&lock_path, e))?;

            if let Err(e) = FileExt::try_lock_exclusive(&file) {
                if e.kind() == fs2::lock_contended_error().kind() {
                    return Err(GuardError::AlreadyRunning {
                        holder_pid: read_holder_pid(&lock_path),
                        path: lock_path,
                    });
                }
                return Err(GuardError::io(&lock_path, e));
            }

            // A releasing holder may have unlinked the marker between our
            // open and lock; then we hold a lock nobody else can see.
            if !still_linked(&file, &lock_path) {
                debug!(
                    "Lock marker {} was replaced during acquire (attempt {})",
                    lock_path.display(),
                    attempt
                );
                continue;
            }

            let mut file = file;
            if let Err(e) = write_holder_pid(&mut file) {
                warn!("Could not record pid in {}: {}", lock_path.display(), e);
            }

            info!(
                "Acquired profile lock {} for user {}",
                lock_path.display(),
                self.layout.user()
            );
            self.state = GuardState::Held { file };
            return Ok(());
        }

        Err(GuardError::AlreadyRunning {
            path: lock_path,
            holder_pid: None,
        })
    }

    /// Give the profile back and delete the marker.
    ///
    /// Only a held guard touches the marker; otherwise this is a no-op.
    /// Safe to call any number of times.
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.state, GuardState::Released) {
            GuardState::Held { file } => {
                let lock_path = self.layout.lock_path();
                if let Err(e) = fs::remove_file(&lock_path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove lock {}: {}", lock_path.display(), e);
                    }
                }
                if let Err(e) = FileExt::unlock(&file) {
                    debug!("Unlock of {} failed: {}", lock_path.display(), e);
                }
                drop(file);
                info!("Released profile lock {}", lock_path.display());
            }
            GuardState::Unacquired => {
                self.state = GuardState::Unacquired;
            }
            GuardState::Released => {}
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_holder_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

/// Best-effort read of the holder's pid; some platforms block reads of a
/// locked file.
fn read_holder_pid(lock_path: &Path) -> Option<u32> {
    let mut content = String::new();
    File::open(lock_path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .ok()?;
    content.trim().parse().ok()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, ProfileLayout) {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProfileLayout::new(temp_dir.path(), "alice");
        (temp_dir, layout)
    }

    #[test]
    fn test_layout_paths() {
        let layout = ProfileLayout::new("/srv/USERS", "alice");
        assert_eq!(layout.profile_dir(), PathBuf::from("/srv/USERS/alice/ARCHIV_USER"));
        assert_eq!(
            layout.lock_path(),
            PathBuf::from("/srv/USERS/alice/ARCHIV_USER/alice.lock")
        );
        assert_eq!(
            layout.config_path(),
            PathBuf::from("/srv/USERS/alice/ARCHIV_USER/Config.ini")
        );
        assert_eq!(
            layout.default_config_path(),
            PathBuf::from("/srv/USERS/DefaultConfig.ini")
        );
    }

    #[test]
    fn test_bootstrap_seeds_config_once() {
        let (_temp_dir, layout) = setup();
        fs::write(layout.default_config_path(), "[sql]\nserver=.\n").unwrap();
        let guard = SessionGuard::new(layout.clone());

        assert_eq!(guard.bootstrap().unwrap(), ConfigSeed::Seeded);
        assert_eq!(
            fs::read_to_string(layout.config_path()).unwrap(),
            "[sql]\nserver=.\n"
        );

        fs::write(layout.config_path(), "[sql]\nserver=custom\n").unwrap();
        assert_eq!(guard.bootstrap().unwrap(), ConfigSeed::AlreadyPresent);
        assert_eq!(
            fs::read_to_string(layout.config_path()).unwrap(),
            "[sql]\nserver=custom\n"
        );
    }

    #[test]
    fn test_bootstrap_without_default() {
        let (_temp_dir, layout) = setup();
        let guard = SessionGuard::new(layout.clone());

        assert_eq!(guard.bootstrap().unwrap(), ConfigSeed::NoDefault);
        assert!(layout.profile_dir().is_dir());
        assert!(!layout.config_path().exists());
    }

    #[test]
    fn test_acquire_writes_pid_and_release_deletes_marker() {
        let (_temp_dir, layout) = setup();
        let mut guard = SessionGuard::new(layout.clone());
        guard.bootstrap().unwrap();

        guard.acquire().unwrap();
        assert!(guard.is_held());
        assert!(layout.lock_path().exists());

        guard.release();
        assert!(!guard.is_held());
        assert!(!layout.lock_path().exists());

        guard.release();
        assert!(matches!(guard.acquire(), Err(GuardError::Released)));
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let (_temp_dir, layout) = setup();
        let guard_a = {
            let mut guard = SessionGuard::new(layout.clone());
            guard.bootstrap().unwrap();
            guard.acquire().unwrap();
            guard
        };

        let mut guard_b = SessionGuard::new(layout.clone());
        guard_b.release();
        assert!(layout.lock_path().exists(), "must not delete a marker it does not hold");

        // Still acquirable afterwards: release on an unacquired guard is not terminal.
        assert!(matches!(
            guard_b.acquire(),
            Err(GuardError::AlreadyRunning { .. })
        ));
        drop(guard_a);
        guard_b.acquire().unwrap();
    }

    #[test]
    fn test_contended_acquire_leaves_marker_untouched() {
        let (_temp_dir, layout) = setup();
        let mut holder = SessionGuard::new(layout.clone());
        holder.bootstrap().unwrap();
        holder.acquire().unwrap();

        let lock_path = layout.lock_path();
        let content_before = fs::read(&lock_path).unwrap();
        let modified_before = fs::metadata(&lock_path).unwrap().modified().unwrap();
        assert_eq!(content_before, format!("{}\n", std::process::id()).into_bytes());

        let mut contender = SessionGuard::new(layout);
        match contender.acquire() {
            Err(GuardError::AlreadyRunning { path, holder_pid }) => {
                assert_eq!(path, lock_path);
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }

        assert_eq!(fs::read(&lock_path).unwrap(), content_before);
        assert_eq!(
            fs::metadata(&lock_path).unwrap().modified().unwrap(),
            modified_before
        );
        assert!(holder.is_held());
        assert!(!contender.is_held());
    }

    #[test]
    fn test_stale_marker_is_taken_over() {
        let (_temp_dir, layout) = setup();
        fs::create_dir_all(layout.profile_dir()).unwrap();
        fs::write(layout.lock_path(), "12345\n").unwrap();

        let mut guard = SessionGuard::new(layout);
        guard.acquire().unwrap();
        assert!(guard.is_held());
    }

    #[test]
    fn test_drop_releases() {
        let (_temp_dir, layout) = setup();
        {
            let mut guard = SessionGuard::new(layout.clone());
            guard.bootstrap().unwrap();
            guard.acquire().unwrap();
        }
        assert!(!layout.lock_path().exists());

        let mut guard = SessionGuard::new(layout);
        guard.acquire().unwrap();
    }
}
