//! ELF introspection for the bundle head
//!
//! An AppBundle is a valid ELF whose trailing bytes are a filesystem image.
//! The image begins exactly at the end of the section table:
//! `e_shoff + e_shentsize * e_shnum`. That formula is a format contract;
//! no page rounding is applied on either side.

use std::{fs::File, path::Path};

use goblin::elf::Elf;
use memmap2::Mmap;

use crate::error::{Error, Result};

/// Section holding the CBOR-encoded RuntimeInfo record.
pub const RUNTIME_INFO_SECTION: &str = ".pbundle_runtime_info";

/// Section holding the zstd-compressed static-tools tarball.
pub const STATIC_TOOLS_SECTION: &str = ".pbundle_static_tools";

fn section_table_end(elf: &Elf) -> u64 {
    elf.header.e_shoff + elf.header.e_shentsize as u64 * elf.header.e_shnum as u64
}

fn section_bytes(elf: &Elf, data: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    for header in &elf.section_headers {
        if elf.shdr_strtab.get_at(header.sh_name) != Some(name) {
            continue;
        }
        let start = header.sh_offset as usize;
        let end = start
            .checked_add(header.sh_size as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::Other(format!("section {name} exceeds file bounds")))?;
        return Ok(Some(data[start..end].to_vec()));
    }
    Ok(None)
}

/// Byte offset at which trailing payload begins. Handles 32- and 64-bit
/// classes in either byte order (goblin honors the declared ident).
pub fn section_end_offset<P: AsRef<Path>>(path: P) -> Result<u64> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let elf = Elf::parse(&mmap)?;
    Ok(section_table_end(&elf))
}

/// Contents of a named section, or `None` when the section is absent.
pub fn read_section<P: AsRef<Path>>(path: P, name: &str) -> Result<Option<Vec<u8>>> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let elf = Elf::parse(&mmap)?;
    section_bytes(&elf, &mmap, name)
}

/// Single-parse introspection: the section-table end offset plus the bytes
/// of one named section. This is the loader's slow path.
pub fn introspect<P: AsRef<Path>>(path: P, name: &str) -> Result<(u64, Option<Vec<u8>>)> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let elf = Elf::parse(&mmap)?;
    let section = section_bytes(&elf, &mmap, name)?;
    Ok((section_table_end(&elf), section))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Minimal 64-bit little-endian ELF header with no program or section
    /// headers. e_shoff points just past the header.
    fn minimal_elf64_le(shoff: u64, shentsize: u16, shnum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // little endian
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        buf[40..48].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
        buf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        buf[58..60].copy_from_slice(&shentsize.to_le_bytes()); // e_shentsize
        buf[60..62].copy_from_slice(&shnum.to_le_bytes()); // e_shnum
        buf
    }

    /// Minimal 32-bit big-endian ELF header, exercising the other class and
    /// byte order.
    fn minimal_elf32_be(shoff: u32, shentsize: u16, shnum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 52];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 1; // ELFCLASS32
        buf[5] = 2; // big endian
        buf[6] = 1;
        buf[16..18].copy_from_slice(&2u16.to_be_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&20u16.to_be_bytes()); // EM_PPC
        buf[20..24].copy_from_slice(&1u32.to_be_bytes());
        buf[32..36].copy_from_slice(&shoff.to_be_bytes()); // e_shoff
        buf[40..42].copy_from_slice(&52u16.to_be_bytes()); // e_ehsize
        buf[46..48].copy_from_slice(&shentsize.to_be_bytes()); // e_shentsize
        buf[48..50].copy_from_slice(&shnum.to_be_bytes()); // e_shnum
        buf
    }

    #[test]
    fn test_offset_formula_elf64() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&minimal_elf64_le(64, 64, 0)).unwrap();
        // goblin always reads the null section header entry at e_shoff even
        // when e_shnum is 0, so the file must physically contain it.
        file.write_all(&[0u8; 64]).unwrap();
        // Trailing payload must not shift the computed offset.
        file.write_all(b"payload-bytes").unwrap();
        file.flush().unwrap();

        assert_eq!(section_end_offset(file.path()).unwrap(), 64);
    }

    #[test]
    fn test_offset_formula_counts_entries() {
        let mut file = NamedTempFile::new().unwrap();
        let header = minimal_elf64_le(128, 64, 3);
        file.write_all(&header).unwrap();
        // Pad out to shoff plus three zeroed section headers.
        file.write_all(&vec![0u8; 64 + 3 * 64]).unwrap();
        file.flush().unwrap();

        assert_eq!(section_end_offset(file.path()).unwrap(), 128 + 3 * 64);
    }

    #[test]
    fn test_offset_formula_elf32_big_endian() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&minimal_elf32_be(52, 40, 0)).unwrap();
        // goblin always reads the null section header entry at e_shoff even
        // when e_shnum is 0, so the file must physically contain it.
        file.write_all(&[0u8; 40]).unwrap();
        file.flush().unwrap();

        assert_eq!(section_end_offset(file.path()).unwrap(), 52);
    }

    #[test]
    fn test_missing_section_is_none() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&minimal_elf64_le(64, 64, 0)).unwrap();
        // goblin always reads the null section header entry at e_shoff even
        // when e_shnum is 0, so the file must physically contain it.
        file.write_all(&[0u8; 64]).unwrap();
        file.flush().unwrap();

        let (offset, section) = introspect(file.path(), RUNTIME_INFO_SECTION).unwrap();
        assert_eq!(offset, 64);
        assert!(section.is_none());
    }

    #[test]
    fn test_non_elf_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho not an elf\n").unwrap();
        file.flush().unwrap();

        assert!(section_end_offset(file.path()).is_err());
    }
}
