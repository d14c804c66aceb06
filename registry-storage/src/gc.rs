//! Mark-and-sweep garbage collection
//!
//! The mark phase walks every manifest of every repository, seeds the mark
//! set with tagged manifests and follows their references. Untagged
//! manifests become deletion candidates, but only once enumeration is
//! complete and only if nothing reachable referenced them. Nothing is deleted
//! until marking has finished for every repository in scope.

use std::collections::{BTreeMap, BTreeSet};

use futures::TryStreamExt;

use crate::blobs::BlobScope;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::Manifest;
use crate::name::RepositoryName;
use crate::registry::{Registry, Repository};

/// Garbage collection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOptions {
    /// Delete manifests that no tag points at.
    pub remove_untagged: bool,
    /// Report what would be deleted without deleting it.
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            remove_untagged: true,
            dry_run: false,
        }
    }
}

/// A manifest scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDeletion {
    /// Repository holding the manifest.
    pub repository: RepositoryName,
    /// The manifest digest.
    pub digest: Digest,
    /// Every tag in the repository at mark time; any may hold the digest in
    /// its history.
    pub tags: Vec<String>,
}

/// Digests found reachable, per repository.
#[derive(Debug, Clone, Default)]
pub struct MarkSet {
    repositories: BTreeMap<RepositoryName, BTreeSet<Digest>>,
}

impl MarkSet {
    /// Record a digest as reachable from `repository`. Returns false if it
    /// was already marked there.
    pub fn mark(&mut self, repository: &RepositoryName, digest: Digest) -> bool {
        self.repositories
            .entry(repository.clone())
            .or_default()
            .insert(digest)
    }

    /// Whether any repository reaches `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.repositories.values().any(|marks| marks.contains(digest))
    }

    /// Whether `repository` reaches `digest`.
    pub fn contains_in(&self, repository: &RepositoryName, digest: &Digest) -> bool {
        self.repositories
            .get(repository)
            .is_some_and(|marks| marks.contains(digest))
    }

    /// Number of distinct reachable digests.
    pub fn len(&self) -> usize {
        self.repositories
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Whether nothing is marked.
    pub fn is_empty(&self) -> bool {
        self.repositories.values().all(BTreeSet::is_empty)
    }
}

/// The output of the mark phase.
#[derive(Debug, Clone, Default)]
pub struct MarkResult {
    /// Reachable digests.
    pub marks: MarkSet,
    /// Manifests to remove.
    pub deletions: Vec<ManifestDeletion>,
}

/// What a collection run did, or would do in a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Distinct reachable digests.
    pub marked: usize,
    /// Manifests removed.
    pub manifests_deleted: Vec<ManifestDeletion>,
    /// Blob copies removed, with the scope they were removed from.
    pub blobs_deleted: Vec<(BlobScope, Digest)>,
    /// Repository blob links removed while blob bytes stayed in the global store.
    pub links_removed: Vec<(RepositoryName, Digest)>,
    /// Nothing was actually deleted.
    pub dry_run: bool,
}

/// Runs mark and sweep against a registry.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    registry: Registry,
    options: GcOptions,
}

impl GarbageCollector {
    pub(crate) fn new(registry: Registry, options: GcOptions) -> Self {
        Self { registry, options }
    }

    /// Mark every repository without deleting anything.
    pub async fn mark(&self) -> RegistryResult<MarkResult> {
        let mut result = MarkResult::default();
        for name in self.registry.repositories().await? {
            let repository = self.registry.repository(name)?;
            self.mark_repository(&repository, &mut result).await?;
        }
        Ok(result)
    }

    /// Collect the whole registry.
    ///
    /// Writers are excluded for the duration of the run.
    #[tracing::instrument(level = "info", skip(self), fields(dry_run = self.options.dry_run))]
    pub async fn run(&self) -> RegistryResult<GcReport> {
        let _maintenance = self.registry.maintenance_guard().await;

        let names = self.registry.repositories().await?;
        let mut repositories = Vec::with_capacity(names.len());
        let mut marked = MarkResult::default();
        for name in names {
            let repository = self.registry.repository(name)?;
            self.mark_repository(&repository, &mut marked).await?;
            repositories.push(repository);
        }

        let mut report = self.sweep(&repositories, &marked).await?;

        if !self.registry.config().repository_blob_store() {
            let blobs: Vec<Digest> = self
                .registry
                .global_blobs()
                .enumerate()
                .try_collect()
                .await
                .map_err(RegistryError::enumeration("global blobs"))?;
            for digest in blobs {
                if marked.marks.contains(&digest) {
                    continue;
                }
                if !self.options.dry_run {
                    self.registry.vacuum().remove_blob(&digest).await?;
                }
                report.blobs_deleted.push((BlobScope::Global, digest));
            }
        }

        tracing::info!(
            marked = report.marked,
            manifests = report.manifests_deleted.len(),
            blobs = report.blobs_deleted.len(),
            links = report.links_removed.len(),
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Collect a single repository.
    ///
    /// Removes the repository's unreachable manifests and its unreachable blob
    /// copies or links. The global store is never swept here: other
    /// repositories were not marked.
    #[tracing::instrument(level = "info", skip(self), fields(%name, dry_run = self.options.dry_run))]
    pub async fn run_repository(&self, name: &RepositoryName) -> RegistryResult<GcReport> {
        let _maintenance = self.registry.maintenance_guard().await;

        let repository = self.registry.repository(name.clone())?;
        let mut marked = MarkResult::default();
        self.mark_repository(&repository, &mut marked).await?;

        self.sweep(std::slice::from_ref(&repository), &marked).await
    }

    async fn mark_repository(
        &self,
        repository: &Repository,
        result: &mut MarkResult,
    ) -> RegistryResult<()> {
        let name = repository.name();
        let mut candidates = Vec::new();
        let mut worklist: Vec<(Digest, bool)> = Vec::new();

        let mut enumerated = BTreeSet::new();
        let mut manifests = repository.manifests().enumerate();
        while let Some(digest) = manifests
            .try_next()
            .await
            .map_err(RegistryError::enumeration(format!("manifests in {name}")))?
        {
            enumerated.insert(digest.clone());
            if self.options.remove_untagged {
                let tags = repository
                    .tags()
                    .lookup(&digest)
                    .await
                    .map_err(RegistryError::enumeration(format!("tags for {digest} in {name}")))?;

                if tags.is_empty() {
                    tracing::info!(repository = %name, %digest, "manifest eligible for deletion");
                    let all = repository
                        .tags()
                        .all()
                        .await
                        .map_err(RegistryError::enumeration(format!("tags in {name}")))?;
                    candidates.push(ManifestDeletion {
                        repository: name.clone(),
                        digest,
                        tags: all,
                    });
                    continue;
                }
            }

            worklist.push((digest, false));
        }

        // Manifests linked only by the legacy layout are missing from the
        // enumeration but still reachable through their tags.
        let tags = repository
            .tags()
            .all()
            .await
            .map_err(RegistryError::enumeration(format!("tags in {name}")))?;
        for tag in tags {
            let digest = match repository.tags().get(&tag).await {
                Ok(descriptor) => descriptor.digest,
                Err(RegistryError::TagUnknown(_)) => continue,
                Err(err) => {
                    return Err(RegistryError::enumeration(format!("tag {tag} in {name}"))(err));
                }
            };
            if !enumerated.contains(&digest) {
                tracing::debug!(repository = %name, %tag, %digest, "tagged manifest outside revisions");
                worklist.push((digest, true));
            }
        }

        while let Some((digest, referenced)) = worklist.pop() {
            if !result.marks.mark(name, digest.clone()) {
                continue;
            }
            tracing::info!(repository = %name, %digest, "marking manifest");

            let manifest = match repository.manifests().get(&digest).await {
                Ok(manifest) => manifest,
                Err(RegistryError::ManifestUnknown { .. }) if referenced => {
                    tracing::warn!(repository = %name, %digest, "referenced manifest is missing");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let is_list = matches!(manifest, Manifest::List(_));
            for descriptor in manifest.references() {
                if is_list {
                    worklist.push((descriptor.digest, true));
                } else {
                    tracing::debug!(repository = %name, digest = %descriptor.digest, "marking blob");
                    result.marks.mark(name, descriptor.digest);
                }
            }
        }

        candidates.retain(|candidate| {
            let reachable = result.marks.contains_in(name, &candidate.digest);
            if reachable {
                tracing::info!(
                    repository = %name,
                    digest = %candidate.digest,
                    "untagged manifest is referenced, keeping it"
                );
            }
            !reachable
        });
        result.deletions.extend(candidates);
        Ok(())
    }

    async fn sweep(
        &self,
        repositories: &[Repository],
        marked: &MarkResult,
    ) -> RegistryResult<GcReport> {
        let vacuum = self.registry.vacuum();
        let mut report = GcReport {
            marked: marked.marks.len(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        for deletion in &marked.deletions {
            if !self.options.dry_run {
                vacuum
                    .remove_manifest(&deletion.repository, &deletion.digest, &deletion.tags)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            repository = %deletion.repository,
                            digest = %deletion.digest,
                            error = %err,
                            "failed to delete manifest"
                        );
                    })?;
            }
            report.manifests_deleted.push(deletion.clone());
        }

        for repository in repositories {
            let name = repository.name();
            let blobs = if repository.is_scoped() {
                repository.blob_store().enumerate()
            } else {
                repository.blobs().enumerate()
            };
            let linked: Vec<Digest> = blobs
                .try_collect()
                .await
                .map_err(RegistryError::enumeration(format!("blobs in {name}")))?;

            for digest in linked {
                if marked.marks.contains_in(name, &digest) {
                    continue;
                }
                if !self.options.dry_run {
                    vacuum.remove_repository_blob(name, &digest).await?;
                }
                if repository.is_scoped() {
                    report
                        .blobs_deleted
                        .push((repository.blob_store().scope().clone(), digest));
                } else {
                    report.links_removed.push((name.clone(), digest));
                }
            }
        }

        Ok(report)
    }
}
