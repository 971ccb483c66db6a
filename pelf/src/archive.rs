//! Archive assembler: packs an AppDir into a SquashFS or DwarFS image

use std::{
    fs::File,
    io::Read,
    path::Path,
    process::{Command, Stdio},
};

use pbundle_meta::FilesystemType;
use tracing::debug;

use crate::{
    error::{Error, Result},
    toolset::ToolSearch,
};

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const DWARFS_MAGIC: &[u8; 6] = b"DWARFS";

/// Pack `appdir` into `image` with the requested filesystem.
///
/// `compression` is a free-form argument string; when present it is split on
/// whitespace and replaces the default packer configuration.
pub fn pack_appdir(
    appdir: &Path,
    image: &Path,
    fs_type: FilesystemType,
    compression: Option<&str>,
    tools: &ToolSearch,
) -> Result<()> {
    if !appdir.is_dir() {
        return Err(Error::BadAppDir(appdir.to_path_buf()));
    }

    match fs_type {
        FilesystemType::Squashfs => {
            let tool = tools.require("mksquashfs")?;
            let mut cmd = Command::new(tool);
            cmd.arg(appdir).arg(image);
            match compression {
                Some(args) => {
                    cmd.args(args.split_whitespace());
                }
                None => {
                    cmd.args(["-comp", "zstd", "-Xcompression-level", "22"]);
                }
            }
            cmd.arg("-noappend");
            run_packer(cmd, "mksquashfs")?;
        }
        FilesystemType::Dwarfs => {
            let tool = tools.require("mkdwarfs")?;
            let mut cmd = Command::new(tool);
            cmd.arg("-i").arg(appdir).arg("-o").arg(image).arg("--force");
            match compression {
                Some(args) => {
                    cmd.args(args.split_whitespace());
                }
                None => {
                    cmd.args(["-l7", "--metadata-compression", "null"]);
                }
            }
            run_packer(cmd, "mkdwarfs")?;
        }
    }

    verify_image_magic(image, fs_type)
}

fn run_packer(mut cmd: Command, tool: &str) -> Result<()> {
    debug!("running {:?}", cmd);
    let output = cmd.stdin(Stdio::null()).output().map_err(|e| Error::ToolFailed {
        tool: tool.to_string(),
        detail: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ToolFailed {
            tool: tool.to_string(),
            detail: format!("exit {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// Cheap sanity check that the packer produced what we asked for, before the
/// image gets welded onto a loader.
fn verify_image_magic(image: &Path, fs_type: FilesystemType) -> Result<()> {
    let mut magic = [0u8; 6];
    let mut file = File::open(image)?;
    file.read_exact(&mut magic)
        .map_err(|_| Error::Other(format!("image {} is truncated", image.display())))?;

    let ok = match fs_type {
        FilesystemType::Squashfs => &magic[..4] == SQUASHFS_MAGIC,
        FilesystemType::Dwarfs => &magic == DWARFS_MAGIC,
    };
    if !ok {
        return Err(Error::Other(format!(
            "image {} does not look like {}",
            image.display(),
            fs_type
        )));
    }
    Ok(())
}
