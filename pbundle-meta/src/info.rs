//! RuntimeInfo: the CBOR metadata record stored in `.pbundle_runtime_info`

use std::{fmt::Display, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Execution strategy used when `mountOrExtract` is absent from the record.
pub const DEFAULT_MOUNT_OR_EXTRACT: u8 = 2;

fn default_mount_or_extract() -> u8 {
    DEFAULT_MOUNT_OR_EXTRACT
}

/// Format of the filesystem image appended to the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemType {
    #[serde(rename = "squashfs")]
    Squashfs,
    #[serde(rename = "dwarfs")]
    Dwarfs,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Squashfs => "squashfs",
            FilesystemType::Dwarfs => "dwarfs",
        }
    }

    /// Infer the image format from an output file name
    /// (`.sqfs.AppBundle` / `.dwfs.AppBundle`).
    pub fn from_output_name<P: AsRef<Path>>(path: P) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_str()?;
        if name.ends_with(".sqfs.AppBundle") {
            Some(FilesystemType::Squashfs)
        } else if name.ends_with(".dwfs.AppBundle") {
            Some(FilesystemType::Dwarfs)
        } else {
            None
        }
    }
}

impl Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "squashfs" => Ok(FilesystemType::Squashfs),
            "dwarfs" => Ok(FilesystemType::Dwarfs),
            other => Err(Error::UnknownFilesystem(other.to_string())),
        }
    }
}

/// Metadata blob embedded in every AppBundle.
///
/// The serde renames are the wire contract; the CBOR keys must not drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    #[serde(rename = "appBundleID")]
    pub app_bundle_id: String,

    #[serde(rename = "pelfVersion")]
    pub pelf_version: String,

    #[serde(rename = "hostInfo")]
    pub host_info: String,

    #[serde(rename = "filesystemType")]
    pub filesystem_type: FilesystemType,

    /// BLAKE3-256 hex digest of the filesystem image.
    #[serde(rename = "hash")]
    pub hash: String,

    #[serde(rename = "disableRandomWorkDir")]
    pub disable_random_work_dir: bool,

    /// 0 mount-only, 1 extract-only, 2 mount-with-fallback, 3 size-gated.
    #[serde(rename = "mountOrExtract", default = "default_mount_or_extract")]
    pub mount_or_extract: u8,
}

impl RuntimeInfo {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| Error::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode and validate. A record with an empty `appBundleID` is rejected,
    /// as nothing downstream (workdir naming, env exports) can work with it.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let info: RuntimeInfo =
            ciborium::from_reader(bytes).map_err(|e| Error::CborDecode(e.to_string()))?;
        if info.app_bundle_id.is_empty() {
            return Err(Error::CborDecode("record carries an empty appBundleID".into()));
        }
        Ok(info)
    }
}
