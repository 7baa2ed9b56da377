use crate::error::P3Error;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// The only mode accepted for a home directory.
pub const HOME_MODE: u32 = 0o700;

// The umask is process-wide; this lock keeps concurrent `ensure` calls from
// restoring each other's mask. Code outside this module that sets the umask
// is not covered.
static UMASK_LOCK: Mutex<()> = Mutex::new(());

/// Narrows the process umask for its lifetime and restores the previous
/// value on drop.
struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    fn set(mask: libc::mode_t) -> Self {
        // Safety: umask has no failure mode and only swaps an integer.
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // Safety: see UmaskGuard::set.
        unsafe {
            libc::umask(self.previous);
        }
    }
}

/// Private state directory of the engine, owner-only.
#[derive(Debug, PartialEq, Eq)]
pub struct HomeDirectory {
    path: PathBuf,
}

impl HomeDirectory {
    /// Creates `path` (and missing parents) with mode 0700, or accepts an
    /// existing directory whose mode is exactly 0700. A directory with any
    /// other mode is refused and left untouched.
    pub fn ensure(path: impl Into<PathBuf>) -> Result<Self, P3Error> {
        let path = path.into();
        let _lock = UMASK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _umask = UmaskGuard::set(0o077);

        let mut builder = fs::DirBuilder::new();
        builder.mode(HOME_MODE);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            builder
                .recursive(true)
                .create(parent)
                .map_err(|err| P3Error::filesystem(parent, err))?;
            builder.recursive(false);
        }

        match builder.create(&path) {
            Ok(()) => {
                info!(path = %path.display(), "created home directory");
                Ok(Self { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                check_existing(&path)?;
                debug!(path = %path.display(), "using existing home directory");
                Ok(Self { path })
            }
            Err(err) => Err(P3Error::filesystem(&path, err)),
        }
    }

    /// Binds to a directory that already exists, without creating it or
    /// checking its mode. Meant for removal only; use [`ensure`](Self::ensure)
    /// for a home the engine will run in. A symlink is refused.
    pub fn existing(path: impl Into<PathBuf>) -> Result<Self, P3Error> {
        let path = path.into();
        let meta = fs::symlink_metadata(&path).map_err(|err| P3Error::filesystem(&path, err))?;
        if !meta.is_dir() {
            return Err(P3Error::filesystem(
                &path,
                std::io::Error::new(ErrorKind::NotADirectory, "not a directory"),
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory and everything in it. Consumes the handle, so a
    /// destroyed home cannot be used again:
    ///
    /// ```compile_fail
    /// # use p3store_core::HomeDirectory;
    /// let home = HomeDirectory::ensure("/tmp/p3store-doc-destroyed").unwrap();
    /// home.destroy().unwrap();
    /// let _ = home.path();
    /// ```
    pub fn destroy(self) -> Result<(), P3Error> {
        debug!(path = %self.path.display(), "destroying home directory");
        fs::remove_dir_all(&self.path).map_err(|err| P3Error::filesystem(&self.path, err))
    }
}

fn check_existing(path: &Path) -> Result<(), P3Error> {
    let meta = fs::symlink_metadata(path).map_err(|err| P3Error::filesystem(path, err))?;
    if !meta.is_dir() {
        return Err(P3Error::filesystem(
            path,
            std::io::Error::new(ErrorKind::AlreadyExists, "exists and is not a directory"),
        ));
    }
    let mode = meta.mode() & 0o7777;
    if mode != HOME_MODE {
        return Err(P3Error::PermissionMismatch {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// `<tmp>/p3store-gpg-<uid>`
pub fn default_home() -> PathBuf {
    // Safety: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("p3store-gpg-{uid}"))
}
