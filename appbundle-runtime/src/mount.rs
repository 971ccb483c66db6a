//! Mount/extract dispatch
//!
//! A state machine over the bundle's `mountOrExtract` byte decides whether
//! the image is FUSE-mounted or unpacked to disk. A `.pid` sentinel in the
//! workdir marks a live mount for deterministic-workdir reuse.

use std::{
    env,
    fs::{self, File},
    io::Write,
    path::Path,
    process::{Command, Stdio},
    thread,
};

use colored::Colorize;
use log::debug;
use pbundle_meta::FilesystemType;

use crate::{
    config::RuntimeConfig,
    error::{Error, Result},
    provision,
};

/// Images at least this large are extracted instead of mounted under the
/// size-gated strategy.
pub const SIZE_GATE_BYTES: u64 = 350 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    MountOnly,
    ExtractOnly,
    MountWithFallback,
    SizeGated,
}

impl Strategy {
    /// Unknown bytes collapse to the mount-with-fallback default.
    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => Strategy::MountOnly,
            1 => Strategy::ExtractOnly,
            3 => Strategy::SizeGated,
            _ => Strategy::MountWithFallback,
        }
    }
}

/// Make `mount_dir` serve the image content, honoring the bundle strategy.
pub fn provide(cfg: &RuntimeConfig, patterns: &[String]) -> Result<()> {
    provide_at(cfg, &cfg.mount_dir, patterns)
}

/// The same strategy dispatch against an arbitrary target directory
/// (`--pbundle_mount <dir>`). An extract-only bundle extracts here too
/// instead of attempting a raw FUSE mount.
pub fn provide_at(cfg: &RuntimeConfig, target: &Path, patterns: &[String]) -> Result<()> {
    if sentinel_is_live(cfg, target)? {
        return Ok(());
    }
    fs::create_dir_all(target)?;

    match Strategy::from_byte(cfg.mount_or_extract) {
        Strategy::MountOnly => mount_to(cfg, target)?,
        Strategy::ExtractOnly => extract(cfg, target, patterns)?,
        Strategy::MountWithFallback => mount_with_fallback(cfg, target, patterns)?,
        Strategy::SizeGated => {
            if cfg.image_size < SIZE_GATE_BYTES {
                mount_with_fallback(cfg, target, patterns)?;
            } else {
                extract(cfg, target, patterns)?;
            }
        }
    }

    write_sentinel(cfg)
}

fn mount_with_fallback(cfg: &RuntimeConfig, target: &Path, patterns: &[String]) -> Result<()> {
    match mount_to(cfg, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!(
                "{}: {}; falling back to extraction",
                "Warning".bright_yellow(),
                e
            );
            extract(cfg, target, patterns)
        }
    }
}

/// A `.pid` sentinel with a healthy entry point under `target` means a
/// previous invocation left it serving; mounting again would shadow it.
fn sentinel_is_live(cfg: &RuntimeConfig, target: &Path) -> Result<bool> {
    if !cfg.work_dir.join(".pid").exists() {
        return Ok(false);
    }
    if target.join("AppRun").exists() {
        debug!("reusing populated workdir {}", cfg.work_dir.display());
        return Ok(true);
    }
    // The corrupt-state check only applies to the reusable default workdir;
    // a fresh custom target legitimately has no AppRun yet.
    if cfg.disable_random_workdir && target == cfg.mount_dir {
        return Err(Error::CorruptWorkdir(cfg.work_dir.clone()));
    }
    Ok(false)
}

fn write_sentinel(cfg: &RuntimeConfig) -> Result<()> {
    let mut file = File::create(cfg.work_dir.join(".pid"))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// FUSE-mount the image over the target directory.
fn mount_to(cfg: &RuntimeConfig, target: &Path) -> Result<()> {
    let tools = provision::ensure_tools(cfg, provision::mount_tools(cfg.fs_type))?;
    let helper = &tools[0];

    let mut cmd = Command::new(helper);
    match cfg.fs_type {
        FilesystemType::Squashfs => {
            cmd.arg("-o")
                .arg("ro,nodev,noatime")
                .arg("-o")
                .arg("uid=0,gid=0")
                .arg("-o")
                .arg(format!("offset={}", cfg.archive_offset))
                .arg(&cfg.self_path)
                .arg(target);
        }
        FilesystemType::Dwarfs => {
            cmd.arg(&cfg.self_path)
                .arg(target)
                .arg("-o")
                .arg(DwarfsTuning::from_env().options(cfg.archive_offset));
        }
    }

    debug!("mounting via {:?}", cmd);
    let output = cmd.stdin(Stdio::null()).output()?;
    if !output.status.success() {
        return Err(Error::MountFailed(format!(
            "{} exit {}: {}",
            helper.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Extract the image into `dest`, optionally limited to glob patterns.
pub fn extract(cfg: &RuntimeConfig, dest: &Path, patterns: &[String]) -> Result<()> {
    let tool_name = provision::extract_tool(cfg.fs_type);
    let tools = provision::ensure_tools(cfg, &[tool_name])?;
    let tool = &tools[0];

    let mut cmd = Command::new(tool);
    match cfg.fs_type {
        FilesystemType::Squashfs => {
            cmd.arg("-f")
                .arg("-no-xattrs")
                .arg("-o")
                .arg(cfg.archive_offset.to_string())
                .arg("-d")
                .arg(dest)
                .arg(&cfg.self_path)
                .args(patterns);
        }
        FilesystemType::Dwarfs => {
            cmd.arg("-i")
                .arg(&cfg.self_path)
                .arg("--image-offset")
                .arg(cfg.archive_offset.to_string())
                .arg("-o")
                .arg(dest);
            for pattern in patterns {
                cmd.arg("--pattern").arg(pattern);
            }
        }
    }

    debug!("extracting via {:?}", cmd);
    let output = cmd.stdin(Stdio::null()).output()?;
    if !output.status.success() {
        return Err(Error::ExtractFailed(format!(
            "{} exit {}: {}",
            tool.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// DwarFS mount tuning, every knob overridable through the environment.
struct DwarfsTuning {
    cachesize: String,
    blocksize: String,
    readahead: String,
    workers: String,
    tidy: String,
    debug: bool,
}

impl DwarfsTuning {
    fn from_env() -> Self {
        let get = |key: &str, fallback: &str| {
            env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };
        let default_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string();
        Self {
            cachesize: get("DWARFS_CACHESIZE", "256m"),
            blocksize: get("DWARFS_BLOCKSIZE", "512k"),
            readahead: get("DWARFS_READAHEAD", "32m"),
            workers: get("DWARFS_WORKERS", &default_workers),
            tidy: get(
                "DWARFS_TIDY_STRATEGY",
                "tidy_strategy=time,tidy_interval=2s,tidy_max_age=10s,seq_detector=1",
            ),
            debug: env::var_os("ENABLE_FUSE_DEBUG").is_some_and(|v| !v.is_empty()),
        }
    }

    fn options(&self, offset: u64) -> String {
        format!(
            "offset={},ro,nodev,noatime,cachesize={},blocksize={},readahead={},workers={},{},cache_files,no_cache_image,clone_fd,block_allocator=mmap,debuglevel={}",
            offset,
            self.cachesize,
            self.blocksize,
            self.readahead,
            self.workers,
            self.tidy,
            if self.debug { "debug" } else { "error" },
        )
    }
}
