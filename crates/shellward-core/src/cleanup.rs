//! Scratch directories - per-execution `/tmp` mounts and their cleanup
//!
//! Each container run gets a fresh host directory. Removal is retried a few
//! times with jittered backoff; if it still fails, a `.delete_flag` marker is
//! left next to the directory and the next process start sweeps it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

pub const DELETE_FLAG_SUFFIX: &str = ".delete_flag";

const SCRATCH_PREFIX: &str = "sandbox_mount_";
const CLEANUP_ATTEMPTS: u32 = 3;

/// Root directory under which scratch directories are created
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create(&self, execution_id: &str) -> std::io::Result<ScratchDir> {
        let path = self.root.join(format!("{}{}", SCRATCH_PREFIX, execution_id));
        tokio::fs::create_dir_all(&path).await?;
        debug!("Scratch: created {:?}", path);
        Ok(ScratchDir {
            path,
            released: false,
        })
    }

    /// Remove a scratch directory, retrying with backoff.
    ///
    /// Returns false when the directory had to be marked for lazy deletion.
    pub async fn release(&self, mut dir: ScratchDir) -> bool {
        dir.released = true;
        let path = dir.path.clone();
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2);

        loop {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    debug!("Scratch: removed {:?}", path);
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return true,
                Err(e) => {
                    if backoff.exceeded_max_attempts(CLEANUP_ATTEMPTS - 1) {
                        warn!(
                            "Scratch: could not remove {:?} after {} attempts: {}",
                            path, CLEANUP_ATTEMPTS, e
                        );
                        mark_for_deletion(&path);
                        return false;
                    }
                    let delay = backoff.next_jittered();
                    warn!(
                        "Scratch: cleanup retry {}/{} for {:?} in {:?}: {}",
                        backoff.attempt,
                        CLEANUP_ATTEMPTS - 1,
                        path,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delete directories left behind by earlier processes.
    ///
    /// The target is derived from the marker's file name, never from its
    /// contents, so a marker cannot point outside the scratch root.
    pub fn sweep_marked(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Scratch: cannot read {:?} for sweep: {}", self.root, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(target_name) = name
                .to_str()
                .and_then(|n| n.strip_suffix(DELETE_FLAG_SUFFIX))
            else {
                continue;
            };
            if !target_name.starts_with(SCRATCH_PREFIX) {
                continue;
            }

            let target = self.root.join(target_name);
            match std::fs::remove_dir_all(&target) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Scratch: marked directory {:?} still not removable: {}", target, e);
                    continue;
                }
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("Scratch: could not remove marker {:?}: {}", entry.path(), e);
            }
        }

        if removed > 0 {
            info!("Scratch: swept {} directories marked for deletion", removed);
        }
        removed
    }
}

/// A scratch directory owned by one execution.
///
/// Dropping it without [`ScratchArea::release`] (an aborted or panicking run)
/// makes one removal attempt and marks it on failure. Inside a tokio runtime
/// the attempt runs on the blocking pool.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_abandoned(&path));
            }
            Err(_) => remove_abandoned(&path),
        }
    }
}

fn remove_abandoned(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!("Scratch: removed {:?} on drop", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!("Scratch: removal on drop failed for {:?}: {}", path, e);
            mark_for_deletion(path);
        }
    }
}

fn flag_path(path: &Path) -> PathBuf {
    let mut flag = path.as_os_str().to_owned();
    flag.push(DELETE_FLAG_SUFFIX);
    PathBuf::from(flag)
}

fn mark_for_deletion(path: &Path) {
    let flag = flag_path(path);
    match std::fs::write(&flag, path.to_string_lossy().as_bytes()) {
        Ok(()) => info!("Scratch: marked {:?} for deletion on next startup", path),
        Err(e) => warn!("Scratch: could not write deletion marker {:?}: {}", flag, e),
    }
}
