//! Extension storage backends.
//!
//! The `Storage` trait is the single capability set the query engine
//! and HTTP surface program against. A local filesystem backend and a
//! remote Artifactory backend implement it; the signing decorator
//! wraps either one. `open_storage` constructs the right stack from
//! configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::manifest::{asset_type, Asset, VsixManifest};
use crate::vsix;

pub mod artifactory;
pub mod local;
pub mod signature;
pub mod version;

use version::Version;

/// Byte stream handed back by [`Storage::open`]; local files, remote
/// response bodies, and synthesized archives all flow through it.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// An additional file persisted next to the extracted assets.
#[derive(Debug, Clone)]
pub struct ExtraFile {
    /// Path relative to the version directory.
    pub path: String,
    pub contents: Vec<u8>,
}

/// Callback invoked once per extension by [`Storage::walk_extensions`]
/// with the latest-version manifest and the full sorted version list.
/// Callbacks run sequentially; returning an error aborts the walk.
pub type WalkCallback<'a> =
    &'a mut (dyn FnMut(Arc<VsixManifest>, &[Version]) -> Result<()> + Send);

/// Capability set shared by every backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Ingest a VSIX: extract the manifest and addressable assets,
    /// store the archive itself, then store each extra file. Returns
    /// a human-readable location for the stored version.
    async fn add_extension(
        &self,
        manifest: &VsixManifest,
        vsix: &[u8],
        extra: Vec<ExtraFile>,
    ) -> Result<String>;

    /// Open a stored file at `publisher/name/version-dir/asset`.
    async fn open(&self, path: &str) -> Result<FileReader>;

    /// Load the manifest for one stored version. The returned
    /// manifest always carries a `VSIXPackage` asset pointing at the
    /// stored archive, whether or not one was persisted.
    async fn manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>>;

    /// Remove stored versions. `None` removes every version; a
    /// universal version removes that version directory; naming a
    /// concrete target platform is unsupported. Returns the removed
    /// versions.
    async fn remove_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Vec<Version>>;

    /// List stored versions, newest first.
    async fn versions(&self, publisher: &str, name: &str) -> Result<Vec<Version>>;

    /// Invoke `callback` once per stored extension with its
    /// latest-version manifest and full version list.
    async fn walk_extensions(&self, callback: WalkCallback<'_>) -> Result<()>;
}

/// Configuration consumed by [`open_storage`].
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub extensions_dir: Option<PathBuf>,
    pub artifactory_uri: Option<String>,
    pub artifactory_repo: Option<String>,
    pub artifactory_token: Option<String>,
    pub list_cache_duration: Duration,
    /// Path to a base64-encoded ed25519 seed; enables the signing
    /// decorator when present.
    pub signing_key: Option<PathBuf>,
}

/// Construct the backend described by `config`, wrapping it with the
/// signing decorator when a signing key is configured.
pub async fn open_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    let backend: Arc<dyn Storage> = match (&config.extensions_dir, &config.artifactory_uri) {
        (Some(dir), None) => Arc::new(local::LocalStorage::new(dir.clone())?),
        (None, Some(uri)) => {
            let repo = config
                .artifactory_repo
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("--artifactory requires --repo"))?;
            let token = config
                .artifactory_token
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Artifactory storage requires ARTIFACTORY_TOKEN"))?;
            Arc::new(
                artifactory::ArtifactoryStorage::connect(
                    uri,
                    repo,
                    token,
                    config.list_cache_duration,
                )
                .await?,
            )
        }
        (Some(_), Some(_)) => {
            anyhow::bail!("--extensions-dir and --artifactory are mutually exclusive")
        }
        (None, None) => anyhow::bail!("either --extensions-dir or --artifactory is required"),
    };

    match &config.signing_key {
        Some(path) => {
            let key = signature::load_signing_key(path)?;
            Ok(Arc::new(signature::SignatureStorage::new(backend, key)))
        }
        None => Ok(backend),
    }
}

/// `<publisher>.<name>-<version-dir>.vsix`, the canonical archive
/// file name within a version directory.
pub fn vsix_file_name(publisher: &str, name: &str, version: &Version) -> String {
    format!("{publisher}.{name}-{version}.vsix")
}

/// `publisher/name/version-dir`, the canonical storage path.
pub fn extension_dir(publisher: &str, name: &str, version: &Version) -> String {
    format!("{publisher}/{name}/{version}")
}

/// Ensure the manifest advertises the stored VSIX archive.
pub fn with_package_asset(
    mut manifest: VsixManifest,
    publisher: &str,
    name: &str,
    version: &Version,
) -> VsixManifest {
    if manifest.asset(asset_type::VSIX_PACKAGE).is_none() {
        manifest.assets.asset.push(Asset {
            asset_type: asset_type::VSIX_PACKAGE.to_string(),
            path: vsix_file_name(publisher, name, version),
            addressable: true,
        });
    }
    manifest
}

/// Split a `publisher.name` or `publisher.name@version` identifier.
/// The version part is returned verbatim (possibly empty).
pub fn parse_extension_id(id: &str) -> Result<(String, String, String)> {
    let (publisher, rest) = id
        .split_once('.')
        .ok_or_else(|| Error::Validation(format!("invalid extension id {id:?}")))?;
    let (name, version) = match rest.split_once('@') {
        Some((name, version)) => (name, version),
        None => (rest, ""),
    };
    if publisher.is_empty() || name.is_empty() {
        return Err(Error::Validation(format!("invalid extension id {id:?}")));
    }
    Ok((
        publisher.to_string(),
        name.to_string(),
        version.to_string(),
    ))
}

/// Compute the set of archive entries `add_extension` must extract:
/// the manifest, every addressable asset, and (for web extensions)
/// everything under the `browser` prefix from `package.json`.
pub(crate) fn extract_set(manifest: &VsixManifest, vsix: &[u8]) -> Result<HashSet<String>> {
    let mut wanted: HashSet<String> = HashSet::new();
    wanted.insert(vsix::MANIFEST_ENTRY.to_string());
    for asset in &manifest.assets.asset {
        if asset.addressable && !asset.path.is_empty() {
            wanted.insert(asset.path.clone());
        }
    }

    if let Some(package_asset) = manifest.asset(asset_type::MANIFEST) {
        match vsix::read_entry(vsix, &package_asset.path) {
            Ok(bytes) => {
                let package = crate::manifest::parse_package_json(&bytes)?;
                if let Some(browser) = package.browser.as_deref() {
                    let prefix = browser_prefix(&package_asset.path, browser);
                    vsix::walk(vsix, |name, _, _| {
                        if name.starts_with(&prefix) {
                            wanted.insert(name.to_string());
                        }
                        Ok(())
                    })?;
                }
            }
            // A manifest may list a package.json the archive lacks;
            // nothing to extract for it then.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    Ok(wanted)
}

/// Join the directory of the package.json asset with the cleaned
/// `browser` entry to get the web bundle prefix.
fn browser_prefix(package_json_path: &str, browser: &str) -> String {
    let dir = match package_json_path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    let browser = clean_path(browser);
    if dir.is_empty() {
        browser
    } else {
        format!("{dir}/{browser}")
    }
}

/// Lexical path cleanup: resolves `.` and `..` segments and collapses
/// separators, staying within the archive root.
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
