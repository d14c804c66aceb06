//! Storage layout.
//!
//! ```text
//! docker/registry/v2
//! ├── blobs/<alg>/<hex[..2]>/<hex>/data                    global blob data
//! └── repositories/<name>
//!     ├── _blobs/<alg>/<hex[..2]>/<hex>/data               scoped blob data
//!     ├── _layers/<alg>/<hex>/link                         blob links (legacy manifest links)
//!     ├── _manifests
//!     │   ├── revisions/<alg>/<hex>/link                   manifest links
//!     │   └── tags/<tag>
//!     │       ├── current/link                             current tag target
//!     │       └── index/<alg>/<hex>/link                   every digest the tag held
//!     └── _uploads/<uuid>/{data,startedat}                 upload sessions
//! ```
//!
//! A link file holds the digest string it points at.

use camino::{Utf8Path, Utf8PathBuf};

use crate::blobs::BlobScope;
use crate::digest::Digest;
use crate::name::RepositoryName;

const ROOT: &str = "docker/registry/v2";

/// Directory holding every repository.
pub(crate) fn repositories_root() -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{ROOT}/repositories"))
}

fn repository_root(name: &RepositoryName) -> Utf8PathBuf {
    repositories_root().join(name.as_str())
}

/// Directory holding blob data for a scope, one level above the algorithm.
pub(crate) fn blobs_root(scope: &BlobScope) -> Utf8PathBuf {
    match scope {
        BlobScope::Global => Utf8PathBuf::from(format!("{ROOT}/blobs")),
        BlobScope::Repository(name) => repository_root(name).join("_blobs"),
    }
}

pub(crate) fn blob_data_path(scope: &BlobScope, digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    blobs_root(scope)
        .join(digest.algorithm())
        .join(&hex[..2])
        .join(hex)
        .join("data")
}

pub(crate) fn layer_links_root(name: &RepositoryName) -> Utf8PathBuf {
    repository_root(name).join("_layers")
}

pub(crate) fn layer_link_path(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    link_path(&layer_links_root(name), digest)
}

pub(crate) fn manifest_revisions_root(name: &RepositoryName) -> Utf8PathBuf {
    repository_root(name).join("_manifests").join("revisions")
}

pub(crate) fn manifest_revision_link_path(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    link_path(&manifest_revisions_root(name), digest)
}

pub(crate) fn manifest_tags_root(name: &RepositoryName) -> Utf8PathBuf {
    repository_root(name).join("_manifests").join("tags")
}

pub(crate) fn manifest_tag_path(name: &RepositoryName, tag: &str) -> Utf8PathBuf {
    manifest_tags_root(name).join(tag)
}

pub(crate) fn manifest_tag_current_path(name: &RepositoryName, tag: &str) -> Utf8PathBuf {
    manifest_tag_path(name, tag).join("current").join("link")
}

pub(crate) fn manifest_tag_index_entry_path(
    name: &RepositoryName,
    tag: &str,
    digest: &Digest,
) -> Utf8PathBuf {
    link_path(&manifest_tag_path(name, tag).join("index"), digest)
}

pub(crate) fn upload_root(name: &RepositoryName, uuid: &str) -> Utf8PathBuf {
    repository_root(name).join("_uploads").join(uuid)
}

pub(crate) fn upload_data_path(name: &RepositoryName, uuid: &str) -> Utf8PathBuf {
    upload_root(name, uuid).join("data")
}

pub(crate) fn upload_started_at_path(name: &RepositoryName, uuid: &str) -> Utf8PathBuf {
    upload_root(name, uuid).join("startedat")
}

fn link_path(root: &Utf8Path, digest: &Digest) -> Utf8PathBuf {
    root.join(digest.algorithm()).join(digest.hex()).join("link")
}

/// Recover the digest from a listed `<root>/<alg>/<hex>/link` key.
pub(crate) fn digest_from_link(root: &Utf8Path, key: &str) -> Option<Digest> {
    let rest = Utf8Path::new(key).strip_prefix(root).ok()?;
    let parts: Vec<&str> = rest.iter().collect();
    match parts.as_slice() {
        ["sha256", hex, "link"] => Digest::from_hex(hex),
        _ => None,
    }
}

/// Recover the digest from a listed `<root>/<alg>/<hex[..2]>/<hex>/data` key.
pub(crate) fn digest_from_blob_data(root: &Utf8Path, key: &str) -> Option<Digest> {
    let rest = Utf8Path::new(key).strip_prefix(root).ok()?;
    let parts: Vec<&str> = rest.iter().collect();
    match parts.as_slice() {
        ["sha256", prefix, hex, "data"] if hex.starts_with(prefix) => Digest::from_hex(hex),
        _ => None,
    }
}

/// Recover the tag name from a listed `<tags root>/<tag>/current/link` key.
pub(crate) fn tag_from_current_link<'k>(root: &Utf8Path, key: &'k str) -> Option<&'k str> {
    let rest = Utf8Path::new(key).strip_prefix(root).ok()?;
    let parts: Vec<&str> = rest.iter().collect();
    match parts.as_slice() {
        [tag, "current", "link"] => Some(*tag),
        _ => None,
    }
}

/// Recover the repository name from any key under the repositories root.
///
/// Repository names never contain a component starting with `_`, so the
/// name is everything before the first such component.
pub(crate) fn repository_from_key(key: &str) -> Option<RepositoryName> {
    let root = repositories_root();
    let rest = Utf8Path::new(key).strip_prefix(&root).ok()?;
    let name: Vec<&str> = rest.iter().take_while(|c| !c.starts_with('_')).collect();
    if name.is_empty() || name.len() == rest.iter().count() {
        return None;
    }
    RepositoryName::new(name.join("/")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::from_bytes(b"layer")
    }

    fn repo() -> RepositoryName {
        RepositoryName::new("library/app").unwrap()
    }

    #[test]
    fn blob_paths() {
        let d = digest();
        let global = blob_data_path(&BlobScope::Global, &d);
        assert_eq!(
            global.as_str(),
            format!("docker/registry/v2/blobs/sha256/{}/{}/data", &d.hex()[..2], d.hex())
        );
        assert_eq!(
            digest_from_blob_data(&blobs_root(&BlobScope::Global), global.as_str()),
            Some(d.clone())
        );

        let scoped = blob_data_path(&BlobScope::Repository(repo()), &d);
        assert!(scoped.as_str().starts_with("docker/registry/v2/repositories/library/app/_blobs/sha256/"));
    }

    #[test]
    fn link_paths() {
        let d = digest();
        let link = manifest_revision_link_path(&repo(), &d);
        assert_eq!(
            link.as_str(),
            format!(
                "docker/registry/v2/repositories/library/app/_manifests/revisions/sha256/{}/link",
                d.hex()
            )
        );
        assert_eq!(
            digest_from_link(&manifest_revisions_root(&repo()), link.as_str()),
            Some(d.clone())
        );

        let layer = layer_link_path(&repo(), &d);
        assert!(layer.as_str().contains("/_layers/sha256/"));
        assert_eq!(digest_from_link(&layer_links_root(&repo()), "nonsense"), None);
    }

    #[test]
    fn tag_paths() {
        let current = manifest_tag_current_path(&repo(), "latest");
        assert_eq!(
            current.as_str(),
            "docker/registry/v2/repositories/library/app/_manifests/tags/latest/current/link"
        );
        let root = manifest_tags_root(&repo());
        assert_eq!(tag_from_current_link(&root, current.as_str()), Some("latest"));

        let index = manifest_tag_index_entry_path(&repo(), "latest", &digest());
        assert_eq!(tag_from_current_link(&root, index.as_str()), None);
    }

    #[test]
    fn repository_names_from_keys() {
        let key = manifest_tag_current_path(&repo(), "latest");
        assert_eq!(repository_from_key(key.as_str()), Some(repo()));
        assert_eq!(repository_from_key("docker/registry/v2/repositories/app"), None);
        assert_eq!(repository_from_key("docker/registry/v2/blobs/sha256/ab"), None);
    }
}
