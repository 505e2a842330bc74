//! Filesystem layer extraction.
//!
//! Layers are gzipped tars applied in manifest order onto one directory, so
//! a later layer overwrites paths written by an earlier one. OCI whiteout
//! entries delete paths from lower layers.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

/// Docker schema 2 gzip layer.
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// OCI gzip layer.
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Whether extraction understands a layer media type.
pub fn is_supported_layer(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_DOCKER_LAYER_GZIP | MEDIA_TYPE_OCI_LAYER_GZIP
    )
}

/// Unpack a single gzipped tar layer onto `dest`.
pub fn unpack_layer(layer_path: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(layer_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_overwrite(true);
    extract_archive(&mut archive, dest)
}

/// Extract a tar archive handling whiteouts.
fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> io::Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if file_name == OPAQUE_WHITEOUT {
            // Opaque whiteout: hide everything lower layers put in this directory
            let parent = path.parent().unwrap_or(Path::new(""));
            let Some(full_parent) = contained_path(dest, parent)? else {
                warn!(path = %path.display(), "Skipping whiteout outside the rootfs");
                continue;
            };
            let is_dir = fs::symlink_metadata(&full_parent).is_ok_and(|m| m.is_dir());
            if is_dir {
                for child in fs::read_dir(&full_parent)? {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = path.parent().unwrap_or(Path::new(""));
            match contained_path(dest, &parent.join(target_name))? {
                Some(target) => {
                    debug!(path = %target.display(), "Applying whiteout");
                    remove_path(&target)?;
                }
                None => warn!(path = %path.display(), "Skipping whiteout outside the rootfs"),
            }
            continue;
        }

        // A file replacing a directory (or the reverse) needs the old entry gone first
        let Some(full_path) = contained_path(dest, &path)? else {
            warn!(path = %path.display(), "Skipping entry outside the rootfs");
            continue;
        };
        if let Ok(existing) = fs::symlink_metadata(&full_path) {
            let replacing_dir = existing.is_dir() && !entry.header().entry_type().is_dir();
            if replacing_dir {
                fs::remove_dir_all(&full_path)?;
            }
        }

        entry.unpack_in(dest)?;
    }

    Ok(())
}

/// `rel` under `dest` with symlinked directories resolved, or `None` when
/// one of them leads outside `dest`. The final component is not followed.
fn contained_path(dest: &Path, rel: &Path) -> io::Result<Option<PathBuf>> {
    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    let Some((last, dirs)) = parts.split_last() else {
        return Ok(Some(dest.to_path_buf()));
    };

    let root = fs::canonicalize(dest)?;
    let mut resolved = root.clone();
    for (i, dir) in dirs.iter().enumerate() {
        let next = resolved.join(dir);
        match fs::canonicalize(&next) {
            Ok(real) if real.starts_with(&root) => resolved = real,
            Ok(_) => return Ok(None),
            // Nothing exists below a missing directory
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                resolved = next;
                resolved.extend(&dirs[i + 1..]);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(resolved.join(last)))
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
