// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk scratch buffers.
//!
//! A scratch file is created at its final size in one `set_len` call, so the
//! filesystem allocates it sparsely instead of writing zeros. Records are then
//! written with positional I/O on a shared handle; distinct records never
//! overlap, so concurrent writers need no lock.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

/// A file that is deleted when this guard is dropped.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    path: PathBuf,
    file: Arc<File>,
}

impl ScratchFile {
    /// Create `path` holding `header` and sized to `len` bytes in total.
    pub(crate) fn create(path: PathBuf, header: &[u8], len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        // From here on the guard owns the path
        let guard = Self {
            path,
            file: Arc::new(file),
        };
        let mut writer: &File = &guard.file;
        writer.write_all(header)?;
        guard.file.set_len(len.max(header.len() as u64))?;
        Ok(guard)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle for positional writes.
    pub(crate) fn handle(&self) -> Arc<File> {
        self.file.clone()
    }

    pub(crate) fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Gzip the contents into a sibling `.gz` scratch file, consuming (and
    /// thereby deleting) the raw file.
    pub(crate) fn compress(self) -> io::Result<ScratchFile> {
        let gz_path = {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(".gz");
            PathBuf::from(name)
        };
        let out = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&gz_path)?;
        let compressed = ScratchFile {
            path: gz_path,
            file: Arc::new(out.try_clone()?),
        };

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.flush()?;
        Ok(compressed)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file"),
        }
    }
}

/// Write all of `buf` at `offset` without moving any shared cursor.
#[cfg(unix)]
pub(crate) fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Write all of `buf` at `offset` without moving any shared cursor.
#[cfg(windows)]
pub(crate) fn write_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Format a byte count with binary units, e.g. `1.5 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_create_is_presized_and_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.access_grid");
        let scratch = ScratchFile::create(path.clone(), b"HEADER", 64).unwrap();
        assert_eq!(scratch.len().unwrap(), 64);

        write_at(&scratch.handle(), 60, &7i32.to_le_bytes()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..6], b"HEADER");
        assert!(bytes[6..60].iter().all(|&b| b == 0));
        assert_eq!(&bytes[60..], &7i32.to_le_bytes());

        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken");
        std::fs::write(&path, b"x").unwrap();
        assert!(ScratchFile::create(path.clone(), b"", 4).is_err());
        // The pre-existing file is not ours to delete
        assert!(path.exists());
    }

    #[test]
    fn test_compress_replaces_raw_with_gzip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.access_grid");
        let scratch = ScratchFile::create(path.clone(), b"ACCESSGR", 4096).unwrap();
        write_at(&scratch.handle(), 100, b"payload").unwrap();

        let gz = scratch.compress().unwrap();
        assert!(!path.exists());
        assert!(gz.path().exists());
        assert!(gz.len().unwrap() < 4096);

        let mut decoded = Vec::new();
        GzDecoder::new(File::open(gz.path()).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded.len(), 4096);
        assert_eq!(&decoded[..8], b"ACCESSGR");
        assert_eq!(&decoded[100..107], b"payload");

        let gz_path = gz.path().to_path_buf();
        drop(gz);
        assert!(!gz_path.exists());
    }
}
