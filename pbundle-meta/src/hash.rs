//! BLAKE3 checksums for whole files and trailing regions

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use blake3::Hasher;

/// Compute the BLAKE3 hash of a file.
pub fn b3sum<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    b3sum_from(path, 0)
}

/// Compute the BLAKE3 hash of bytes `[offset, EOF)`.
///
/// This is how a bundle's image digest is recomputed in place: the image is
/// never copied out of the containing file.
pub fn b3sum_from<P: AsRef<Path>>(path: P, offset: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Hasher::new();

    let mut buffer = [0u8; 65536]; // 64KB buffer
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
