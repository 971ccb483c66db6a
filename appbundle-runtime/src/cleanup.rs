//! Teardown choreography
//!
//! The loader must not outlive the entry point, but the FUSE helper
//! daemonizes and keeps the mount alive, so unmounting falls to a detached
//! child: a re-exec of the bundle in its own session that polls the mount
//! away after both ancestors are gone.

use std::{
    ffi::CString,
    fs, mem,
    os::unix::{ffi::OsStrExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use log::debug;

use crate::config::RuntimeConfig;

const UNMOUNT_ATTEMPTS: u32 = 5;

/// Everything the detached child and the signal thread need, detached from
/// the borrow of `RuntimeConfig`.
#[derive(Debug, Clone)]
pub struct TeardownPlan {
    pub self_path: PathBuf,
    pub mount_dir: PathBuf,
    pub pool_dir: PathBuf,
    pub work_dir: PathBuf,
    /// False for deterministic workdirs; invocations that hold a mount open
    /// clear it too.
    pub enabled: bool,
}

impl From<&RuntimeConfig> for TeardownPlan {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            self_path: cfg.self_path.clone(),
            mount_dir: cfg.mount_dir.clone(),
            pool_dir: cfg.pool_dir.clone(),
            work_dir: cfg.work_dir.clone(),
            enabled: !cfg.no_cleanup,
        }
    }
}

fn fsid(path: &Path) -> Option<[i32; 2]> {
    let cstr = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statfs = unsafe { mem::zeroed() };
    if unsafe { libc::statfs(cstr.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    // fsid_t is two ints on every Linux libc
    Some(unsafe { mem::transmute_copy(&stat.f_fsid) })
}

/// A mount point sits on a different filesystem than its parent.
pub fn is_mounted(mount_dir: &Path) -> bool {
    let Some(parent) = mount_dir.parent() else {
        return false;
    };
    match (fsid(mount_dir), fsid(parent)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// Re-exec the bundle as a session leader running
/// `--pbundle_internal_Cleanup <mount> <pool> <work> <noUnmount>`.
pub fn spawn_detached(plan: &TeardownPlan, do_not_unmount: bool) {
    let mut cmd = Command::new(&plan.self_path);
    cmd.arg("--pbundle_internal_Cleanup")
        .arg(&plan.mount_dir)
        .arg(&plan.pool_dir)
        .arg(&plan.work_dir)
        .arg(if do_not_unmount { "1" } else { "0" })
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    if let Err(e) = cmd.spawn() {
        debug!("could not spawn cleanup child: {}", e);
    }
}

/// Body of `--pbundle_internal_Cleanup`: unmount with retries, drop the
/// workdir, drop the pool only when it emptied out.
pub fn run_internal(
    mount_dir: &Path,
    pool_dir: &Path,
    work_dir: &Path,
    do_not_unmount: bool,
) -> i32 {
    if !do_not_unmount {
        let mut attempts = 0;
        while is_mounted(mount_dir) && attempts < UNMOUNT_ATTEMPTS {
            unmount(pool_dir, mount_dir, false);
            attempts += 1;
            if is_mounted(mount_dir) {
                thread::sleep(Duration::from_secs(1));
            }
        }
        if is_mounted(mount_dir) {
            unmount(pool_dir, mount_dir, true);
        }
    }

    let _ = fs::remove_dir_all(work_dir);
    // remove_dir refuses non-empty directories, which is the guard against
    // concurrent bundles still using the pool.
    let _ = fs::remove_dir(pool_dir);
    0
}

/// `--pbundle_cleanup`: sweep every workdir this bundle identity owns.
pub fn force_cleanup(cfg: &RuntimeConfig) {
    let prefix = format!("pbundle_{}_", cfg.r_exe_name);
    if let Ok(entries) = fs::read_dir(&cfg.pool_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            let work_dir = entry.path();
            run_internal(&work_dir.join("mounted"), &cfg.pool_dir, &work_dir, false);
        }
    }
    let _ = fs::remove_dir(&cfg.pool_dir);
}

fn unmount(pool_dir: &Path, mount_dir: &Path, lazy: bool) {
    let Some(tool) = find_fusermount(pool_dir) else {
        return;
    };
    let mut cmd = Command::new(tool);
    cmd.arg(if lazy { "-uz" } else { "-u" });
    let _ = cmd
        .arg(mount_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

fn find_fusermount(pool_dir: &Path) -> Option<PathBuf> {
    let static_dir = pool_dir.join(".static");
    for name in ["fusermount3", "fusermount"] {
        let local = static_dir.join(name);
        if local.is_file() {
            return Some(local);
        }
        if let Ok(found) = which::which(name) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_dir_is_not_mounted() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("mounted");
        fs::create_dir_all(&inner).unwrap();
        assert!(!is_mounted(&inner));
    }

    #[test]
    fn test_run_internal_removes_workdir_and_empty_pool() {
        let root = TempDir::new().unwrap();
        let pool = root.path().join(".pelfbundles");
        let work = pool.join("pbundle_demo_0011aabb");
        let mount = work.join("mounted");
        fs::create_dir_all(&mount).unwrap();
        fs::write(work.join(".pid"), "123\n").unwrap();

        run_internal(&mount, &pool, &work, false);

        assert!(!work.exists());
        assert!(!pool.exists());
    }

    #[test]
    fn test_run_internal_keeps_busy_pool() {
        let root = TempDir::new().unwrap();
        let pool = root.path().join(".pelfbundles");
        let work = pool.join("pbundle_demo_0011aabb");
        let other = pool.join("pbundle_other_ffee0022");
        fs::create_dir_all(work.join("mounted")).unwrap();
        fs::create_dir_all(&other).unwrap();

        run_internal(&work.join("mounted"), &pool, &work, false);

        assert!(!work.exists());
        // Another bundle still lives here; the pool must survive.
        assert!(pool.exists());
        assert!(other.exists());
    }
}
