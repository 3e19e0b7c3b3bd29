//! Blob storage for source documents and result artifacts.
//!
//! Everything is addressed by `s3://container/key` URIs, even when the
//! backing store is a local directory.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::{
    errors::BlobError,
    prelude::*,
    retry::{with_backoff, with_timeout},
};

pub mod fs;
pub mod s3;

/// The URI scheme we accept.
const URI_SCHEME: &str = "s3://";

/// Split `s3://container/rest` into `("container", "rest")`. `rest` may be
/// empty.
fn split_uri(uri: &str) -> Result<(&str, &str), BlobError> {
    let invalid = || BlobError::InvalidUri(uri.to_owned());
    let scheme = uri.get(..URI_SCHEME.len()).ok_or_else(invalid)?;
    if !scheme.eq_ignore_ascii_case(URI_SCHEME) {
        return Err(invalid());
    }
    let rest = &uri[URI_SCHEME.len()..];
    let (container, key) = rest.split_once('/').unwrap_or((rest, ""));
    if container.is_empty() {
        return Err(invalid());
    }
    Ok((container, key))
}

/// The location of a single blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobLocation {
    /// Bucket or top-level directory.
    pub container: String,

    /// Key within `container`. Never empty.
    pub key: String,
}

impl BlobLocation {
    /// Create a new location.
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Format as an `s3://` URI.
    pub fn to_uri(&self) -> String {
        self.to_string()
    }

    /// The final `/`-separated component of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// The file name without its last extension.
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_SCHEME}{}/{}", self.container, self.key)
    }
}

impl FromStr for BlobLocation {
    type Err = BlobError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (container, key) = split_uri(uri)?;
        if key.is_empty() || key.ends_with('/') {
            return Err(BlobError::InvalidUri(uri.to_owned()));
        }
        Ok(Self::new(container, key))
    }
}

impl TryFrom<String> for BlobLocation {
    type Error = BlobError;

    fn try_from(uri: String) -> Result<Self, Self::Error> {
        uri.parse()
    }
}

impl From<BlobLocation> for String {
    fn from(location: BlobLocation) -> Self {
        location.to_uri()
    }
}

/// A container plus a (possibly empty) key prefix, used to list source
/// documents and to place output artifacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobPrefix {
    /// Bucket or top-level directory.
    pub container: String,

    /// Key prefix, without a trailing `/`. May be empty.
    pub prefix: String,
}

impl BlobPrefix {
    /// Create a new prefix.
    pub fn new(container: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            prefix: prefix.into().trim_end_matches('/').to_owned(),
        }
    }

    /// The location of `name` directly under this prefix.
    pub fn join(&self, name: &str) -> BlobLocation {
        if self.prefix.is_empty() {
            BlobLocation::new(&self.container, name)
        } else {
            BlobLocation::new(&self.container, format!("{}/{name}", self.prefix))
        }
    }

    /// Does `location` fall under this prefix?
    pub fn contains(&self, location: &BlobLocation) -> bool {
        location.container == self.container
            && (self.prefix.is_empty()
                || location
                    .key
                    .strip_prefix(&self.prefix)
                    .is_some_and(|rest| rest.starts_with('/')))
    }
}

impl fmt::Display for BlobPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_SCHEME}{}/{}", self.container, self.prefix)
    }
}

impl FromStr for BlobPrefix {
    type Err = BlobError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (container, prefix) = split_uri(uri)?;
        Ok(Self::new(container, prefix))
    }
}

/// Interface to a blob store.
///
/// From the pipeline's point of view, stores are append-only: we write new
/// keys, and never modify a blob once written.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Read an entire blob.
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError>;

    /// Write an entire blob. Returns once the write is durable.
    async fn write(&self, location: &BlobLocation, data: Vec<u8>) -> Result<(), BlobError>;

    /// List every blob under `prefix`, in key order.
    async fn list(&self, prefix: &BlobPrefix) -> Result<Vec<BlobLocation>, BlobError>;
}

/// Wraps another [`BlobStore`], applying a timeout to each call and retrying
/// transient failures with backoff.
pub struct ResilientBlobStore {
    inner: Arc<dyn BlobStore>,
    call_timeout: Duration,
}

impl ResilientBlobStore {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn BlobStore>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }
}

#[async_trait]
impl BlobStore for ResilientBlobStore {
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        with_backoff("blob read", || {
            with_timeout(self.call_timeout, self.inner.read(location))
        })
        .await
    }

    async fn write(&self, location: &BlobLocation, data: Vec<u8>) -> Result<(), BlobError> {
        with_backoff("blob write", || {
            with_timeout(self.call_timeout, self.inner.write(location, data.clone()))
        })
        .await
    }

    async fn list(&self, prefix: &BlobPrefix) -> Result<Vec<BlobLocation>, BlobError> {
        with_backoff("blob list", || {
            with_timeout(self.call_timeout, self.inner.list(prefix))
        })
        .await
    }
}

/// Does `input` look like a blob URI rather than a local path?
pub fn is_blob_uri(input: &str) -> bool {
    input
        .get(..URI_SCHEME.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(URI_SCHEME))
}

/// Read `input` as either a `s3://` URI (through `store`) or a local path.
pub async fn read_uri_or_path(
    store: Option<&dyn BlobStore>,
    input: &str,
) -> Result<Vec<u8>> {
    if is_blob_uri(input) {
        let location = input.parse::<BlobLocation>()?;
        let store = store.ok_or_else(|| anyhow!("no blob store configured for {input}"))?;
        Ok(store.read(&location).await?)
    } else {
        tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read file at path: {:?}", input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let location = "s3://scans/2024/invoice.pdf".parse::<BlobLocation>().unwrap();
        assert_eq!(location.container, "scans");
        assert_eq!(location.key, "2024/invoice.pdf");
        assert_eq!(location.file_name(), "invoice.pdf");
        assert_eq!(location.file_stem(), "invoice");
        assert_eq!(location.to_uri(), "s3://scans/2024/invoice.pdf");
    }

    #[test]
    fn test_reject_bad_locations() {
        assert!("scans/invoice.pdf".parse::<BlobLocation>().is_err());
        assert!("s3://".parse::<BlobLocation>().is_err());
        assert!("s3://scans".parse::<BlobLocation>().is_err());
        assert!("s3://scans/dir/".parse::<BlobLocation>().is_err());
        assert!("s3:///key".parse::<BlobLocation>().is_err());
    }

    #[test]
    fn test_prefix() {
        let prefix = "s3://out/text/".parse::<BlobPrefix>().unwrap();
        assert_eq!(prefix.prefix, "text");
        assert_eq!(prefix.join("a.txt").to_uri(), "s3://out/text/a.txt");
        assert!(prefix.contains(&BlobLocation::new("out", "text/a.txt")));
        assert!(!prefix.contains(&BlobLocation::new("out", "textual/a.txt")));

        let bare = "s3://out".parse::<BlobPrefix>().unwrap();
        assert_eq!(bare.join("a.txt").to_uri(), "s3://out/a.txt");
        assert!(bare.contains(&BlobLocation::new("out", "x/y")));
    }

    #[test]
    fn test_serde_as_uri() {
        let location = BlobLocation::new("scans", "a.pdf");
        let json = serde_json::to_string(&location).unwrap();
        assert_eq!(json, r#""s3://scans/a.pdf""#);
        let back: BlobLocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, location);
    }
}
