//! Local image archives.
//!
//! A pulled image is stored as one gzip-compressed tar holding
//! `manifest.json` plus one file per blob, named by the hex part of its
//! digest. Unpacking an archive yields the directory layout extraction reads
//! layers from.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use tar::{Archive, Builder, Header};
use tracing::warn;

/// Name of the manifest entry inside an archive.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Writer for a local image archive.
///
/// Data goes to a private temporary file next to the destination, which
/// only replaces the destination once [`ArchiveWriter::finish`] succeeds.
/// Dropping an unfinished writer removes the temporary file.
pub struct ArchiveWriter {
    builder: Builder<GzEncoder<BufWriter<File>>>,
    pending: PendingFile,
    dest: PathBuf,
}

impl ArchiveWriter {
    /// Start an archive that will land at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pending = PendingFile::new(path)?;
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&pending.path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
        Ok(Self {
            builder: Builder::new(encoder),
            pending,
            dest: path.to_path_buf(),
        })
    }

    /// Add the raw manifest bytes.
    pub fn append_manifest(&mut self, manifest: &[u8]) -> io::Result<()> {
        self.append_bytes(MANIFEST_FILE_NAME, manifest)
    }

    /// Add a blob file stored on disk under its digest name.
    pub fn append_blob(&mut self, digest: &str, path: &Path) -> io::Result<()> {
        let name = blob_file_name(digest)?;
        self.builder.append_path_with_name(path, name)
    }

    /// Add an in-memory blob under its digest name.
    pub fn append_blob_bytes(&mut self, digest: &str, data: &[u8]) -> io::Result<()> {
        let name = blob_file_name(digest)?.to_string();
        self.append_bytes(&name, data)
    }

    fn append_bytes(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder.append_data(&mut header, name, data)
    }

    /// Flush all data, sync it and move the archive into place.
    pub fn finish(self) -> io::Result<()> {
        let Self {
            builder,
            mut pending,
            dest,
        } = self;
        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&pending.path, &dest)?;
        pending.persisted = true;
        Ok(())
    }
}

/// Temporary file removed on drop unless it was moved into place.
struct PendingFile {
    path: PathBuf,
    persisted: bool,
}

impl PendingFile {
    fn new(dest: &Path) -> io::Result<Self> {
        let file_name = dest.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("archive path {} has no file name", dest.display()),
            )
        })?;
        let suffix: u64 = rand::rng().random();
        let mut name = OsString::from(file_name);
        name.push(format!(".{suffix:016x}.tmp"));
        Ok(Self {
            path: dest.with_file_name(name),
            persisted: false,
        })
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial archive");
            }
        }
    }
}

/// Unpack an archive into `dest`, creating it if needed.
pub fn unpack(archive_path: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.unpack(dest)
}

/// File name of a blob: the encoded part of its digest.
///
/// Rejects digests whose encoded part could escape the blob directory.
pub fn blob_file_name(digest: &str) -> io::Result<&str> {
    let encoded = digest.split_once(':').map_or(digest, |(_, encoded)| encoded);
    if encoded.is_empty() || !encoded.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid blob digest {digest}"),
        ));
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_file_name() {
        assert_eq!(blob_file_name("sha256:abc123").unwrap(), "abc123");
        assert_eq!(blob_file_name("abc123").unwrap(), "abc123");
        assert!(blob_file_name("sha256:../etc").is_err());
        assert!(blob_file_name("sha256:").is_err());
    }

    #[test]
    fn test_write_and_unpack() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("images/app.tar.gz");

        let blob_src = dir.path().join("blob");
        fs::write(&blob_src, b"layer bytes").unwrap();

        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer.append_manifest(br#"{"schemaVersion":2}"#).unwrap();
        writer.append_blob("sha256:aaaa", &blob_src).unwrap();
        writer.append_blob_bytes("sha256:bbbb", b"config").unwrap();
        writer.finish().unwrap();

        let out = dir.path().join("out");
        unpack(&archive_path, &out).unwrap();

        assert_eq!(
            fs::read_to_string(out.join(MANIFEST_FILE_NAME)).unwrap(),
            r#"{"schemaVersion":2}"#
        );
        assert_eq!(fs::read(out.join("aaaa")).unwrap(), b"layer bytes");
        assert_eq!(fs::read(out.join("bbbb")).unwrap(), b"config");
    }

    #[test]
    fn test_unfinished_writer_keeps_existing_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("app.tar.gz");

        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer.append_manifest(b"first").unwrap();
        writer.finish().unwrap();

        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer.append_manifest(b"second").unwrap();
        drop(writer);

        let out = dir.path().join("out");
        unpack(&archive_path, &out).unwrap();
        assert_eq!(fs::read(out.join(MANIFEST_FILE_NAME)).unwrap(), b"first");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temporary files left: {leftovers:?}");
    }
}
