//! Tags: mutable names for manifest digests within a repository

use std::collections::BTreeSet;

use camino::Utf8Path;
use storage::StorageBucket;

use crate::blobs::list_keys;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::name::{RepositoryName, validate_tag};
use crate::paths;

/// The tags of one repository.
///
/// Each tag keeps a `current` link and an index of every digest it has
/// pointed at.
#[derive(Debug, Clone)]
pub struct TagStore {
    bucket: StorageBucket,
    repository: RepositoryName,
}

impl TagStore {
    pub(crate) fn new(bucket: StorageBucket, repository: RepositoryName) -> Self {
        Self { bucket, repository }
    }

    /// Point `tag` at `descriptor`, recording it in the tag's history.
    #[tracing::instrument(level = "debug", skip(self, descriptor), fields(repository = %self.repository, digest = %descriptor.digest))]
    pub async fn tag(&self, tag: &str, descriptor: &Descriptor) -> RegistryResult<()> {
        validate_tag(tag)?;
        let digest = descriptor.digest.to_string();

        self.bucket
            .put_content(
                &paths::manifest_tag_current_path(&self.repository, tag),
                digest.as_bytes(),
            )
            .await?;
        self.bucket
            .put_content(
                &paths::manifest_tag_index_entry_path(&self.repository, tag, &descriptor.digest),
                digest.as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// The descriptor a tag currently points at.
    pub async fn get(&self, tag: &str) -> RegistryResult<Descriptor> {
        let path = paths::manifest_tag_current_path(&self.repository, tag);
        let content = match self.bucket.get_content(&path).await {
            Ok(content) => content,
            Err(err) if err.is_not_found() => {
                return Err(RegistryError::TagUnknown(tag.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };

        let digest: Digest = String::from_utf8_lossy(&content).trim().parse()?;
        Ok(Descriptor::from_digest(digest))
    }

    /// Remove a tag and its history.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn untag(&self, tag: &str) -> RegistryResult<()> {
        let keys = list_keys(
            &self.bucket,
            &paths::manifest_tag_path(&self.repository, tag),
        )
        .await?;
        if keys.is_empty() {
            return Err(RegistryError::TagUnknown(tag.to_owned()));
        }

        for key in keys {
            self.bucket.delete(Utf8Path::new(&key)).await?;
        }
        Ok(())
    }

    /// Every tag in the repository, sorted.
    pub async fn all(&self) -> RegistryResult<Vec<String>> {
        let root = paths::manifest_tags_root(&self.repository);
        let keys = list_keys(&self.bucket, &root).await?;
        let tags: BTreeSet<&str> = keys
            .iter()
            .filter_map(|key| paths::tag_from_current_link(&root, key))
            .collect();
        Ok(tags.into_iter().map(str::to_owned).collect())
    }

    /// Tags currently pointing at `digest`.
    ///
    /// Any failure other than a tag vanishing mid-scan is returned, so a
    /// caller never mistakes an error for "no tags".
    pub async fn lookup(&self, digest: &Digest) -> RegistryResult<Vec<String>> {
        let mut tags = Vec::new();
        for tag in self.all().await? {
            match self.get(&tag).await {
                Ok(descriptor) if &descriptor.digest == digest => tags.push(tag),
                Ok(_) => {}
                Err(RegistryError::TagUnknown(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(tags)
    }

    /// Every digest `tag` has pointed at, sorted by digest.
    pub async fn history(&self, tag: &str) -> RegistryResult<Vec<Digest>> {
        let root = paths::manifest_tag_path(&self.repository, tag).join("index");
        let keys = list_keys(&self.bucket, &root).await?;
        let digests: BTreeSet<Digest> = keys
            .iter()
            .filter_map(|key| paths::digest_from_link(&root, key))
            .collect();
        Ok(digests.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use storage::{MemoryStorage, Storage};

    fn tags() -> TagStore {
        let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
        TagStore::new(
            storage.bucket("registry"),
            RepositoryName::new("library/app").unwrap(),
        )
    }

    fn descriptor(content: &[u8]) -> Descriptor {
        Descriptor::from_digest(Digest::from_bytes(content))
    }

    #[tokio::test]
    async fn reassigning_a_tag() {
        let tags = tags();
        let old = descriptor(b"old");
        let new = descriptor(b"new");

        tags.tag("latest", &old).await.unwrap();
        assert_eq!(tags.lookup(&old.digest).await.unwrap(), vec!["latest"]);

        tags.tag("latest", &new).await.unwrap();
        assert_eq!(tags.get("latest").await.unwrap().digest, new.digest);
        assert!(tags.lookup(&old.digest).await.unwrap().is_empty());
        assert_eq!(tags.lookup(&new.digest).await.unwrap(), vec!["latest"]);

        let mut expected = vec![old.digest, new.digest];
        expected.sort();
        assert_eq!(tags.history("latest").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn all_is_sorted() {
        let tags = tags();
        assert!(tags.all().await.unwrap().is_empty());

        let d = descriptor(b"m");
        for tag in ["v2", "latest", "v1"] {
            tags.tag(tag, &d).await.unwrap();
        }
        assert_eq!(tags.all().await.unwrap(), vec!["latest", "v1", "v2"]);
        assert_eq!(tags.lookup(&d.digest).await.unwrap(), vec!["latest", "v1", "v2"]);
    }

    #[tokio::test]
    async fn untag_removes_history() {
        let tags = tags();
        let d = descriptor(b"m");
        tags.tag("latest", &d).await.unwrap();

        tags.untag("latest").await.unwrap();
        assert!(matches!(tags.get("latest").await, Err(RegistryError::TagUnknown(_))));
        assert!(tags.history("latest").await.unwrap().is_empty());
        assert!(matches!(tags.untag("latest").await, Err(RegistryError::TagUnknown(_))));
    }

    #[tokio::test]
    async fn invalid_tag_is_rejected() {
        let tags = tags();
        assert!(matches!(
            tags.tag("-bad", &descriptor(b"m")).await,
            Err(RegistryError::TagInvalid(_))
        ));
    }
}
