//! Image reference parsing and cache path derivation.
//!
//! References carry an optional transport prefix (`docker://alpine:3`).
//! The prefix is stripped for the cache key and the on-disk file name, so
//! `docker://alpine:3` and `alpine:3` share one cache entry.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::ImageError;

/// Transport name used for archives in the local cache.
pub const ARCHIVE_TRANSPORT: &str = "docker-archive";

/// Transport names recognized in a reference prefix.
const KNOWN_TRANSPORTS: &[&str] = &[
    "docker",
    "docker-archive",
    "docker-daemon",
    "oci",
    "oci-archive",
    "dir",
    "containers-storage",
    "tarball",
];

/// File names longer than this are truncated before the archive suffix.
const MAX_FILE_STEM_LEN: usize = 200;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    transport: String,
    name: String,
}

impl ImageReference {
    /// Parse a reference such as `docker://ghcr.io/org/app:v1` or `nginx:1.27`.
    ///
    /// A reference without a transport prefix is treated as a registry image.
    pub fn parse(raw: &str) -> Result<Self, ImageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImageError::InvalidReference("empty image reference".to_string()));
        }

        let (transport, name) = match raw.split_once(':') {
            Some((transport, rest)) if KNOWN_TRANSPORTS.contains(&transport) => {
                let name = if transport == "docker" {
                    rest.strip_prefix("//").ok_or_else(|| {
                        ImageError::InvalidReference(format!(
                            "docker reference {raw} must have the form docker://NAME"
                        ))
                    })?
                } else {
                    rest
                };
                (transport.to_string(), name.to_string())
            }
            _ => ("docker".to_string(), raw.to_string()),
        };

        if name.is_empty() {
            return Err(ImageError::InvalidReference(format!(
                "image reference {raw} has no name"
            )));
        }
        if name.contains(char::is_whitespace) {
            return Err(ImageError::InvalidReference(format!(
                "image reference {raw} contains whitespace"
            )));
        }

        Ok(Self { transport, name })
    }

    /// Transport name (`docker`, `oci`, ...).
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Reference with the transport prefix stripped.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key used for the persistent image record.
    pub fn key(&self) -> &str {
        &self.name
    }

    /// Whether this reference can be fetched from a registry.
    pub fn is_registry(&self) -> bool {
        self.transport == "docker"
    }

    /// Split a registry reference into registry host, repository and tag/digest.
    pub fn registry_parts(&self) -> Result<(String, String, String), ImageError> {
        if !self.is_registry() {
            return Err(ImageError::InvalidReference(format!(
                "transport {} cannot be pulled from a registry",
                self.transport
            )));
        }
        parse_image_ref(&self.name)
    }

    /// Deterministic archive path for this reference under `image_dir`.
    pub fn archive_path(&self, image_dir: &Path) -> PathBuf {
        image_dir.join(format!("{}.tar.gz", sanitize_file_name(&self.name)))
    }

    /// Archive path that no other cache key maps to.
    ///
    /// Used when [`ImageReference::archive_path`] is already taken by a
    /// different reference that sanitizes to the same name.
    pub fn unique_archive_path(&self, image_dir: &Path) -> PathBuf {
        let digest = hex::encode(Sha256::digest(self.key().as_bytes()));
        image_dir.join(format!(
            "{}-{}.tar.gz",
            sanitize_file_name(&self.name),
            &digest[..16]
        ))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transport == "docker" {
            write!(f, "docker://{}", self.name)
        } else {
            write!(f, "{}:{}", self.transport, self.name)
        }
    }
}

/// Transport-qualified location string stored in the image record.
pub fn archive_location(path: &Path) -> String {
    format!("{ARCHIVE_TRANSPORT}:{}", path.display())
}

/// Resolve a stored location back into an archive path.
pub fn archive_path_from_location(location: &str) -> Result<PathBuf, ImageError> {
    location
        .strip_prefix(ARCHIVE_TRANSPORT)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            ImageError::InvalidReference(format!("unsupported image location {location}"))
        })
}

/// Make a string safe to use as a single file name.
///
/// Runs of reserved characters collapse into one `-`.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_replaced = false;
    for c in name.chars() {
        let reserved = matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
            || c.is_control();
        if reserved {
            if !last_replaced {
                out.push('-');
            }
            last_replaced = true;
        } else {
            out.push(c);
            last_replaced = false;
        }
    }

    if out == "." || out == ".." || out.is_empty() {
        return "-".to_string();
    }

    if out.len() > MAX_FILE_STEM_LEN {
        let mut cut = MAX_FILE_STEM_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// Parse an image reference into registry, repo, and tag/digest components.
///
/// Examples:
/// - `alpine:latest` -> (registry-1.docker.io, library/alpine, latest)
/// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
/// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
pub fn parse_image_ref(image_ref: &str) -> Result<(String, String, String), ImageError> {
    // Handle digest reference
    let (name_part, reference) = if let Some((name, digest)) = image_ref.rsplit_once('@') {
        (name, digest.to_string())
    } else if let Some((name, tag)) = image_ref.rsplit_once(':') {
        // Make sure this isn't a port number
        if tag.contains('/') || name.ends_with(']') {
            (image_ref, "latest".to_string())
        } else {
            (name, tag.to_string())
        }
    } else {
        (image_ref, "latest".to_string())
    };

    if name_part.is_empty() || reference.is_empty() {
        return Err(ImageError::InvalidReference(image_ref.to_string()));
    }

    let parts: Vec<&str> = name_part.splitn(2, '/').collect();
    let (registry, repo) = if parts.len() == 1 {
        // No slash - Docker Hub library image
        (
            "registry-1.docker.io".to_string(),
            format!("library/{}", parts[0]),
        )
    } else if parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost" {
        (parts[0].to_string(), parts[1].to_string())
    } else {
        // Docker Hub user image
        ("registry-1.docker.io".to_string(), name_part.to_string())
    };

    let registry = if registry == "docker.io" || registry == "index.docker.io" {
        "registry-1.docker.io".to_string()
    } else {
        registry
    };

    Ok((registry, repo, reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("docker://registry/example:v1", "docker", "registry/example:v1")]
    #[case("registry/example:v1", "docker", "registry/example:v1")]
    #[case("oci:/srv/layouts/app", "oci", "/srv/layouts/app")]
    #[case("localhost:5000/app:dev", "docker", "localhost:5000/app:dev")]
    fn test_parse_transport(#[case] raw: &str, #[case] transport: &str, #[case] name: &str) {
        let reference = ImageReference::parse(raw).unwrap();
        assert_eq!(reference.transport(), transport);
        assert_eq!(reference.name(), name);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("docker:alpine").is_err());
        assert!(ImageReference::parse("docker://").is_err());
        assert!(ImageReference::parse("docker://bad name").is_err());
    }

    #[test]
    fn test_same_key_with_and_without_transport() {
        let a = ImageReference::parse("docker://nginx:1.27").unwrap();
        let b = ImageReference::parse("nginx:1.27").unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.to_string(), "docker://nginx:1.27");
    }

    #[test]
    fn test_archive_path_is_sanitized() {
        let reference = ImageReference::parse("docker://registry/example:v1").unwrap();
        let path = reference.archive_path(Path::new("/work/images"));
        assert_eq!(path, PathBuf::from("/work/images/registry-example-v1.tar.gz"));
        assert_eq!(
            archive_location(&path),
            "docker-archive:/work/images/registry-example-v1.tar.gz"
        );
    }

    #[rstest]
    #[case("ghcr.io/org/app@sha256:abc", "ghcr.io-org-app@sha256-abc")]
    #[case("a//b::c", "a-b-c")]
    #[case("..", "-")]
    fn test_sanitize_file_name(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_file_name(input), expected);
    }

    #[test]
    fn test_unique_archive_path_separates_colliding_names() {
        let dir = Path::new("/work/images");
        let tagged = ImageReference::parse("registry/example:v1").unwrap();
        let nested = ImageReference::parse("registry/example/v1").unwrap();

        assert_eq!(tagged.archive_path(dir), nested.archive_path(dir));
        assert_ne!(tagged.unique_archive_path(dir), nested.unique_archive_path(dir));
        assert_eq!(
            tagged.unique_archive_path(dir),
            ImageReference::parse("docker://registry/example:v1")
                .unwrap()
                .unique_archive_path(dir)
        );
    }

    #[test]
    fn test_location_roundtrip() {
        let path = archive_path_from_location("docker-archive:/var/lib/nk/images/x.tar.gz").unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/nk/images/x.tar.gz"));
        assert!(archive_path_from_location("dir:/tmp/x").is_err());
        assert!(archive_path_from_location("docker-archive:").is_err());
    }

    #[test]
    fn test_registry_parts_for_non_registry_transport() {
        let reference = ImageReference::parse("oci:/srv/layout").unwrap();
        assert!(reference.registry_parts().is_err());
    }

    #[test]
    fn test_parse_image_ref_simple() {
        let (registry, repo, tag) = parse_image_ref("alpine:latest").unwrap();
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_ref_no_tag() {
        let (registry, repo, tag) = parse_image_ref("alpine").unwrap();
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_ref_docker_io_alias() {
        let (registry, repo, _) = parse_image_ref("docker.io/library/redis:7").unwrap();
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "library/redis");
    }

    #[test]
    fn test_parse_image_ref_digest() {
        let (registry, repo, digest) =
            parse_image_ref("ghcr.io/org/app@sha256:abcdef1234567890").unwrap();
        assert_eq!(registry, "ghcr.io");
        assert_eq!(repo, "org/app");
        assert_eq!(digest, "sha256:abcdef1234567890");
    }

    #[test]
    fn test_parse_image_ref_localhost() {
        let (registry, repo, tag) = parse_image_ref("localhost:5000/myapp:test").unwrap();
        assert_eq!(registry, "localhost:5000");
        assert_eq!(repo, "myapp");
        assert_eq!(tag, "test");
    }
}
