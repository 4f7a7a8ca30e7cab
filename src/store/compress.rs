use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Write `bytes` to `path` through a staging file in the same directory,
/// so readers only ever see the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path)?;
    let mut staging = NamedTempFile::new_in(dir)?;
    staging.write_all(bytes)?;
    staging.as_file().sync_all()?;
    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Gzip `bytes` and write them atomically to `path`
pub fn write_gz_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic(path, &gzip(bytes)?)
}

pub fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn read_gz(path: &Path) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compress `source` into a new file under `dir`, named `{stem}.json.gz`,
/// or `{stem}-{n}.json.gz` when that name is already taken.
/// Never overwrites an existing file.
pub fn gzip_copy_new(source: &Path, dir: &Path, stem: &str) -> io::Result<PathBuf> {
    let mut input = File::open(source)?;
    let (target, file) = create_unique(dir, stem, "json.gz")?;

    let mut encoder = GzEncoder::new(file, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    Ok(target)
}

fn create_unique(dir: &Path, stem: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}-{}.{}", stem, attempt, ext)
        };
        let candidate = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_gzip_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.json.gz");
        write_gz_atomic(&path, b"[1,2,3]").unwrap();
        assert_eq!(read_gz(&path).unwrap(), b"[1,2,3]");
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        // No staging files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.json");
        std::fs::write(&source, b"{}").unwrap();

        let first = gzip_copy_new(&source, dir.path(), "LN-1_backup_20260101_000000").unwrap();
        let second = gzip_copy_new(&source, dir.path(), "LN-1_backup_20260101_000000").unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("LN-1_backup_20260101_000000-1.json.gz"));
        assert_eq!(read_gz(&second).unwrap(), b"{}");
    }
}
