use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "local";

/// Convert a filesystem error, keeping its kind so that "not found"
/// survives the trip through `eyre`.
fn fs_error(err: std::io::Error, context: &'static str, path: &Utf8Path) -> StorageError {
    let kind = StorageErrorKind::from_io(err.kind());
    StorageError::builder(ENGINE, kind, eyre::Report::new(err).wrap_err(context))
        .path(path.as_str())
        .build()
}

/// Storage driver backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Store buckets as subdirectories of `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn base(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.base(bucket).join(remote)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let remote = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&remote)
            .await
            .map_err(|err| fs_error(err, "local driver: metadata", &remote))?;
        if metadata.is_dir() {
            return Err(StorageError::not_found(ENGINE, bucket, remote.as_str()));
        }

        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .modified()
                .map_err(|err| fs_error(err, "local driver: mtime", &remote))?
                .into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        match tokio::fs::remove_file(&remote).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(fs_error(err, "remove_file", &remote)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| fs_error(err, "create_dir_all", parent))?;
        }

        // Write beside the target and rename, so readers never see a
        // partial file.
        let staging = remote.with_extension(format!("upload-{}", uuid::Uuid::new_v4()));
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&staging)
                .await
                .map_err(|err| fs_error(err, "local: create staging file", &staging))?,
        );

        tokio::io::copy(local, &mut writer)
            .await
            .map_err(|err| fs_error(err, "copy", &staging))?;

        writer
            .shutdown()
            .await
            .map_err(|err| fs_error(err, "shutdown writer", &staging))?;

        tokio::fs::rename(&staging, &remote)
            .await
            .map_err(|err| fs_error(err, "rename into place", &remote))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&remote)
                .await
                .map_err(|err| fs_error(err, "open remote file", &remote))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| fs_error(err, "copy", &remote))?;

        local
            .flush()
            .await
            .map_err(|err| fs_error(err, "flush writer", &remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.base(bucket);
        let target = match prefix {
            Some(prefix) => base.join(prefix),
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &target))
            .in_current_span()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

/// Walk `target` and return every file below it, relative to `base`.
#[tracing::instrument(level = "trace")]
fn collect_list(base: &Utf8Path, target: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if !target.is_dir() {
        return Ok(files);
    }

    visit(target, &mut files).wrap_err_with(|| format!("walking {target}"))?;

    let mut files: Vec<_> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect();
    files.sort();
    Ok(files)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_list_delete() {
        let (_dir, driver) = driver();
        let mut reader = tokio::io::BufReader::new(&b"abc"[..]);
        driver
            .upload("bucket", Utf8Path::new("a/b/data"), &mut reader)
            .await
            .unwrap();

        let listed = driver.list("bucket", Some(Utf8Path::new("a"))).await.unwrap();
        assert_eq!(listed, vec!["a/b/data"]);

        let mut out = Vec::new();
        driver
            .download("bucket", Utf8Path::new("a/b/data"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abc");

        driver.delete("bucket", Utf8Path::new("a/b/data")).await.unwrap();
        let err = driver
            .metadata("bucket", Utf8Path::new("a/b/data"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // Deleting twice is fine.
        driver.delete("bucket", Utf8Path::new("a/b/data")).await.unwrap();
    }

    #[tokio::test]
    async fn list_missing_prefix_is_empty() {
        let (_dir, driver) = driver();
        let listed = driver
            .list("bucket", Some(Utf8Path::new("nothing/here")))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }
}
