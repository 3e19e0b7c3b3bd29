//! A [`BlobStore`] backed by a local directory. Each container is a
//! subdirectory of the root.
//!
//! Handy for local runs and tests. Not meant to be shared between machines.

use std::io;

use tokio::fs;
use uuid::Uuid;

use super::{BlobLocation, BlobPrefix, BlobStore};
use crate::{errors::BlobError, prelude::*};

/// Local-directory blob store.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a new store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a container and key to a path, refusing anything that would escape
    /// the container directory.
    fn path_for(&self, container: &str, key: &str) -> Result<PathBuf, BlobError> {
        let bad_component = |c: &str| c.is_empty() || c == "." || c == "..";
        if bad_component(container) || container.contains(['/', '\\']) {
            return Err(BlobError::InvalidUri(format!("{container}/{key}")));
        }
        let mut path = self.root.join(container);
        if !key.is_empty() {
            for component in key.split('/') {
                if bad_component(component) || component.contains('\\') {
                    return Err(BlobError::InvalidUri(format!("{container}/{key}")));
                }
                path.push(component);
            }
        }
        Ok(path)
    }
}

/// Convert an I/O error for `location`.
fn io_error(location: &BlobLocation, err: io::Error) -> BlobError {
    if err.kind() == io::ErrorKind::NotFound {
        BlobError::NotFound(location.clone())
    } else {
        BlobError::Unavailable(format!("{location}: {err}"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(level = "trace", skip(self), fields(location = %location))]
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(&location.container, &location.key)?;
        fs::read(&path).await.map_err(|err| io_error(location, err))
    }

    #[instrument(level = "trace", skip(self, data), fields(location = %location, bytes = data.len()))]
    async fn write(&self, location: &BlobLocation, data: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(&location.container, &location.key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(location, err))?;
        }
        // Write to a temporary name and rename, so readers never see a
        // half-written artifact. Each writer gets its own temporary file.
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(format!(".{}.partial", Uuid::new_v4()));
        let tmp_path = PathBuf::from(tmp_path);
        fs::write(&tmp_path, &data)
            .await
            .map_err(|err| io_error(location, err))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| io_error(location, err))
    }

    #[instrument(level = "trace", skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &BlobPrefix) -> Result<Vec<BlobLocation>, BlobError> {
        let container_dir = self.path_for(&prefix.container, "")?;
        let mut found = Vec::new();
        let mut pending = vec![(container_dir, String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(BlobError::Unavailable(format!("{dir:?}: {err}"))),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| BlobError::Unavailable(format!("{dir:?}: {err}")))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{key_prefix}{name}");
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| BlobError::Unavailable(format!("{key}: {err}")))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if !name.ends_with(".partial") {
                    let location = BlobLocation::new(&prefix.container, key);
                    if prefix.contains(&location) {
                        found.push(location);
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let a = BlobLocation::new("scans", "batch1/a.pdf");
        let b = BlobLocation::new("scans", "batch1/nested/b.pdf");
        let c = BlobLocation::new("scans", "batch2/c.pdf");
        for location in [&a, &b, &c] {
            store.write(location, b"%PDF".to_vec()).await.unwrap();
        }

        assert_eq!(store.read(&a).await.unwrap(), b"%PDF");
        let listed = store
            .list(&BlobPrefix::new("scans", "batch1"))
            .await
            .unwrap();
        assert_eq!(listed, vec![a, b]);
        let everything = store.list(&BlobPrefix::new("scans", "")).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let location = BlobLocation::new("out", "text/a.txt");
        let contents = (0..8)
            .map(|i| format!("version {i}").into_bytes())
            .collect::<Vec<_>>();

        let results = futures::future::join_all(
            contents
                .iter()
                .map(|data| store.write(&location, data.clone())),
        )
        .await;
        for result in results {
            result.unwrap();
        }

        // One of the writes wins, and no temporary files are left behind.
        let written = store.read(&location).await.unwrap();
        assert!(contents.contains(&written));
        let listed = store.list(&BlobPrefix::new("out", "")).await.unwrap();
        assert_eq!(listed, vec![location]);
        let names = std::fs::read_dir(dir.path().join("out").join("text"))
            .unwrap()
            .count();
        assert_eq!(names, 1);
    }

    #[tokio::test]
    async fn test_missing_blob_and_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let missing = BlobLocation::new("scans", "nope.pdf");
        assert!(matches!(
            store.read(&missing).await,
            Err(BlobError::NotFound(_))
        ));
        let listed = store.list(&BlobPrefix::new("empty", "")).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_refuses_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let sneaky = BlobLocation::new("scans", "../../etc/passwd");
        assert!(matches!(
            store.read(&sneaky).await,
            Err(BlobError::InvalidUri(_))
        ));
    }
}
