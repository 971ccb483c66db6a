//! ELF composer: welds loader, helper archive, metadata and image into a
//! single executable
//!
//! The output stays a valid ELF because readers ignore trailing bytes; the
//! loader finds the image at `shoff + shentsize * shnum`.

use std::{
    env,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use pbundle_meta::{cache, elf, hash, RuntimeInfo};
use tracing::debug;

use crate::{
    error::{Error, Result},
    toolset::ToolSearch,
};

const OBJCOPY_CANDIDATES: &[&str] = &["objcopy", "llvm-objcopy", "eu-objcopy"];

pub struct ComposeRequest<'a> {
    /// Runtime loader executable that becomes the bundle head.
    pub runtime: &'a Path,
    /// Packed filesystem image.
    pub image: &'a Path,
    /// zstd-compressed static-tools tarball, if embedding was requested.
    pub static_tools: Option<&'a [u8]>,
    /// Metadata record; `hash` is filled in here.
    pub info: RuntimeInfo,
    pub output: &'a Path,
}

/// Compose the final AppBundle. Returns the completed metadata record.
pub fn compose(mut request: ComposeRequest<'_>, tools: &ToolSearch) -> Result<RuntimeInfo> {
    fs::copy(request.runtime, request.output)?;

    request.info.hash = hash::b3sum(request.image)?;

    let scratch = tempfile::tempdir()?;
    let info_path = scratch.path().join("runtime_info.cbor");
    fs::write(&info_path, request.info.to_cbor()?)?;

    let objcopy = tools
        .find_any(OBJCOPY_CANDIDATES)
        .ok_or_else(|| Error::ToolNotFound("objcopy".into()))?;
    let mut cmd = Command::new(&objcopy);
    if let Some(bytes) = request.static_tools {
        let tools_path = scratch.path().join("static_tools.tar.zst");
        fs::write(&tools_path, bytes)?;
        cmd.arg("--add-section").arg(format!(
            "{}={}",
            elf::STATIC_TOOLS_SECTION,
            tools_path.display()
        ));
    }
    cmd.arg("--add-section").arg(format!(
        "{}={}",
        elf::RUNTIME_INFO_SECTION,
        info_path.display()
    ));
    cmd.arg(request.output);

    debug!("running {:?}", cmd);
    let output = cmd.stdin(Stdio::null()).output().map_err(|e| Error::ToolFailed {
        tool: "objcopy".to_string(),
        detail: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::ToolFailed {
            tool: "objcopy".to_string(),
            detail: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    // The loader trusts shoff + shentsize * shnum with no padding. If this
    // objcopy left slack after the section table, every offset downstream
    // would be wrong; refuse rather than emit a broken bundle.
    let section_end = elf::section_end_offset(request.output)?;
    let elf_len = fs::metadata(request.output)?.len();
    if section_end != elf_len {
        return Err(Error::Other(format!(
            "{} left {} bytes after the section table; bundle offsets would not line up",
            objcopy.display(),
            elf_len - section_end.min(elf_len)
        )));
    }

    let mut out = OpenOptions::new().append(true).open(request.output)?;
    let mut image = File::open(request.image)?;
    io::copy(&mut image, &mut out)?;
    drop(out);

    // A rebuilt bundle at an old path must not serve a stale cache.
    cache::remove(request.output);

    fs::set_permissions(request.output, fs::Permissions::from_mode(0o755))?;
    Ok(request.info)
}

/// Locate the runtime loader: explicit flag (or `$PELF_RUNTIME`, which clap
/// feeds into the same flag), then a sibling of this executable, then PATH.
pub fn resolve_runtime(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Other(format!(
            "runtime loader {} does not exist",
            path.display()
        )));
    }

    if let Ok(own) = env::current_exe() {
        if let Some(dir) = own.parent() {
            let sibling = dir.join("appbundle-runtime");
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }

    which::which("appbundle-runtime").map_err(|_| Error::RuntimeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_runtime_is_an_error() {
        let result = resolve_runtime(Some(Path::new("/nonexistent/loader")));
        assert!(result.is_err());
    }
}
