//! pbundle-meta: the AppBundle binary format, shared by builder and loader
//!
//! This crate provides:
//! - AppBundleID parsing, canonicalization and sanitization
//! - The RuntimeInfo metadata record and its CBOR wire form
//! - ELF section-table introspection (archive offset, named sections)
//! - BLAKE3 hashing of files and trailing file regions
//! - The `user.RuntimeConfig` extended-attribute cache

pub mod cache;
pub mod elf;
pub mod error;
pub mod hash;
pub mod id;
pub mod info;

pub use error::{Error, Result};
pub use id::AppBundleId;
pub use info::{FilesystemType, RuntimeInfo, DEFAULT_MOUNT_OR_EXTRACT};
