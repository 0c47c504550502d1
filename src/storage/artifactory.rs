//! Artifactory-backed storage.
//!
//! Files live in a generic repository under the same canonical layout
//! as the local backend and are accessed over the token-authenticated
//! REST API. Two caches keep the filesystem-as-database model usable
//! over the network:
//!
//! - a manifest cache, indefinite, keyed by `publisher/name/version`,
//!   with per-key locks so a cold key is fetched exactly once while
//!   unrelated reads stay lock-free;
//! - a list cache holding the depth-3 directory listing for a short
//!   TTL so `walk_extensions` runs without per-directory roundtrips.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future;
use log::{debug, warn};
use serde::Deserialize;
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::manifest::VsixManifest;
use crate::storage::version::Version;
use crate::storage::{
    extension_dir, extract_set, vsix_file_name, with_package_asset, ExtraFile, FileReader, Storage,
    WalkCallback,
};
use crate::vsix;

/// Default lifetime of the directory-listing cache.
pub const DEFAULT_LIST_CACHE_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<ListedFile>,
}

/// One entry of an Artifactory `?list` response. `uri` is relative to
/// the listed path and starts with `/`.
#[derive(Debug, Clone, Deserialize)]
struct ListedFile {
    uri: String,
    #[serde(default)]
    folder: bool,
}

struct ListCache {
    fetched: Instant,
    files: Arc<Vec<ListedFile>>,
}

pub struct ArtifactoryStorage {
    client: reqwest::Client,
    uri: String,
    repo: String,
    token: String,
    list_cache_duration: Duration,
    list_cache: Mutex<Option<ListCache>>,
    manifests: RwLock<HashMap<String, Arc<VsixManifest>>>,
    manifest_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactoryStorage {
    /// Connect to a repository and eagerly warm the manifest cache by
    /// fetching every stored version's manifest in parallel.
    pub async fn connect(
        uri: &str,
        repo: &str,
        token: &str,
        list_cache_duration: Duration,
    ) -> Result<Self> {
        let list_cache_duration = if list_cache_duration.is_zero() {
            DEFAULT_LIST_CACHE_DURATION
        } else {
            list_cache_duration
        };
        let storage = Self {
            client: reqwest::Client::new(),
            uri: uri.trim_end_matches('/').to_string(),
            repo: repo.trim_matches('/').to_string(),
            token: token.to_string(),
            list_cache_duration,
            list_cache: Mutex::new(None),
            manifests: RwLock::new(HashMap::new()),
            manifest_locks: Mutex::new(HashMap::new()),
        };
        storage.warm_manifest_cache().await?;
        Ok(storage)
    }

    fn file_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.uri, self.repo, path.trim_start_matches('/'))
    }

    fn list_url(&self, path: &str, depth: u32) -> String {
        format!(
            "{}/api/storage/{}/{}?list&deep=1&depth={}&listFolders=1",
            self.uri,
            self.repo,
            path.trim_matches('/'),
            depth
        )
    }

    /// Map a response status onto the storage error kinds: 404 is
    /// `NotFound`, any other failure is `Transient` with the upstream
    /// status logged but not leaked.
    fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        debug!("artifactory returned {status} for {path}");
        Err(Error::Transient(format!("request for {path} failed")))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.file_url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check_status(response, path)
    }

    async fn put(&self, path: &str, contents: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .put(self.file_url(path))
            .bearer_auth(&self.token)
            .body(contents)
            .send()
            .await?;
        Self::check_status(response, path).map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.file_url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check_status(response, path).map(|_| ())
    }

    async fn list(&self, path: &str, depth: u32) -> Result<Vec<ListedFile>> {
        let url = self.list_url(path, depth);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let response = Self::check_status(response, path)?;
        let listing: ListResponse = response.json().await?;
        Ok(listing.files)
    }

    /// Depth-3 listing of the whole repository, served from the TTL
    /// cache when fresh. The critical section is a pointer swap; the
    /// refresh itself runs outside the lock.
    async fn cached_listing(&self) -> Result<Arc<Vec<ListedFile>>> {
        {
            let cache = self.list_cache.lock().expect("list cache poisoned");
            if let Some(entry) = cache.as_ref() {
                if entry.fetched.elapsed() < self.list_cache_duration {
                    return Ok(Arc::clone(&entry.files));
                }
            }
        }

        let files = Arc::new(self.list("", 3).await?);
        let mut cache = self.list_cache.lock().expect("list cache poisoned");
        *cache = Some(ListCache {
            fetched: Instant::now(),
            files: Arc::clone(&files),
        });
        Ok(files)
    }

    fn invalidate_list_cache(&self) {
        *self.list_cache.lock().expect("list cache poisoned") = None;
    }

    fn cache_key(publisher: &str, name: &str, version: &Version) -> String {
        extension_dir(publisher, name, version)
    }

    async fn fetch_manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>> {
        let path = format!(
            "{}/{}",
            extension_dir(publisher, name, version),
            vsix::MANIFEST_ENTRY
        );
        let bytes = self.get(&path).await?.bytes().await?;
        let parsed = crate::manifest::parse_manifest(&bytes)?;
        Ok(Arc::new(with_package_asset(
            parsed, publisher, name, version,
        )))
    }

    /// Populate the manifest cache for one key, taking the per-key
    /// lock so concurrent callers of a cold key fetch only once.
    async fn cached_manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>> {
        let key = Self::cache_key(publisher, name, version);
        if let Some(found) = self
            .manifests
            .read()
            .expect("manifest cache poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(found));
        }

        let key_lock = {
            let mut locks = self.manifest_locks.lock().expect("manifest locks poisoned");
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = key_lock.lock().await;

        // Another task may have filled the key while we waited.
        if let Some(found) = self
            .manifests
            .read()
            .expect("manifest cache poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(found));
        }

        let manifest = self.fetch_manifest(publisher, name, version).await?;
        self.manifests
            .write()
            .expect("manifest cache poisoned")
            .insert(key, Arc::clone(&manifest));
        Ok(manifest)
    }

    fn evict_manifests(&self, publisher: &str, name: &str, versions: &[Version]) {
        let mut cache = self.manifests.write().expect("manifest cache poisoned");
        for version in versions {
            cache.remove(&Self::cache_key(publisher, name, version));
        }
    }

    /// List all stored extensions grouped from the cached depth-3
    /// listing, versions sorted newest first.
    async fn grouped_extensions(&self) -> Result<BTreeMap<(String, String), Vec<Version>>> {
        let files = self.cached_listing().await?;
        Ok(group_versions(&files))
    }

    async fn warm_manifest_cache(&self) -> Result<()> {
        let groups = match self.grouped_extensions().await {
            Ok(groups) => groups,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let fetches = groups.iter().flat_map(|((publisher, name), versions)| {
            versions.iter().map(move |version| async move {
                if let Err(err) = self.cached_manifest(publisher, name, version).await {
                    warn!(
                        "failed to warm manifest for {}: {err}",
                        extension_dir(publisher, name, version)
                    );
                }
            })
        });
        future::join_all(fetches).await;
        Ok(())
    }
}

/// Group depth-3 folder entries (`/publisher/name/version-dir`) into
/// per-extension version lists, newest first. Entries that are not
/// three levels deep or do not parse as versions are ignored.
fn group_versions(files: &[ListedFile]) -> BTreeMap<(String, String), Vec<Version>> {
    let mut groups: BTreeMap<(String, String), Vec<Version>> = BTreeMap::new();
    for file in files {
        if !file.folder {
            continue;
        }
        let parts: Vec<&str> = file
            .uri
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() != 3 {
            continue;
        }
        let (publisher, name, version_dir) = (parts[0], parts[1], parts[2]);
        let Ok(version) = version_dir.parse::<Version>() else {
            debug!("skipping unrecognized version directory {version_dir:?}");
            continue;
        };
        groups
            .entry((publisher.to_string(), name.to_string()))
            .or_default()
            .push(version);
    }
    for versions in groups.values_mut() {
        versions.sort();
    }
    groups
}

#[async_trait]
impl Storage for ArtifactoryStorage {
    async fn add_extension(
        &self,
        manifest: &VsixManifest,
        vsix_bytes: &[u8],
        extra: Vec<ExtraFile>,
    ) -> Result<String> {
        manifest.validate()?;
        let version = manifest.version()?;
        let publisher = manifest.metadata.identity.publisher.as_str();
        let name = manifest.metadata.identity.id.as_str();
        let dir = extension_dir(publisher, name, &version);

        // The zip walk is synchronous, so stage wanted entries first
        // and upload afterwards.
        let wanted = extract_set(manifest, vsix_bytes)?;
        let mut staged: Vec<(String, Vec<u8>)> = Vec::new();
        vsix::walk(vsix_bytes, |entry, size, reader| {
            if !wanted.contains(entry) {
                return Ok(());
            }
            let mut contents = Vec::with_capacity(size as usize);
            std::io::Read::read_to_end(reader, &mut contents)?;
            staged.push((format!("{dir}/{entry}"), contents));
            Ok(())
        })?;

        for (path, contents) in staged {
            self.put(&path, contents).await?;
        }
        self.put(
            &format!("{dir}/{}", vsix_file_name(publisher, name, &version)),
            vsix_bytes.to_vec(),
        )
        .await?;
        for file in extra {
            self.put(&format!("{dir}/{}", file.path), file.contents)
                .await?;
        }

        // Refresh caches so the new version is visible immediately.
        self.evict_manifests(publisher, name, std::slice::from_ref(&version));
        self.invalidate_list_cache();

        Ok(self.file_url(&dir))
    }

    async fn open(&self, path: &str) -> Result<FileReader> {
        let response = self.get(path).await?;
        let stream = futures::TryStreamExt::map_err(response.bytes_stream(), std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>> {
        self.cached_manifest(publisher, name, version).await
    }

    async fn remove_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Vec<Version>> {
        let removed = match version {
            None => {
                let versions = self.versions(publisher, name).await?;
                if versions.is_empty() {
                    return Err(Error::NotFound(format!("extension {publisher}.{name}")));
                }
                self.delete(&format!("{publisher}/{name}")).await?;
                versions
            }
            Some(version) if !version.is_universal() => {
                return Err(Error::Validation(
                    "removing a specific target platform is not supported".to_string(),
                ))
            }
            Some(version) => {
                self.delete(&extension_dir(publisher, name, version)).await?;
                vec![version.clone()]
            }
        };

        self.evict_manifests(publisher, name, &removed);
        self.invalidate_list_cache();
        Ok(removed)
    }

    async fn versions(&self, publisher: &str, name: &str) -> Result<Vec<Version>> {
        let files = self.list(&format!("{publisher}/{name}"), 1).await?;
        let mut versions = Vec::new();
        for file in &files {
            if !file.folder {
                continue;
            }
            let dir_name = file.uri.trim_matches('/');
            match dir_name.parse::<Version>() {
                Ok(version) => versions.push(version),
                Err(_) => debug!("skipping unrecognized version directory {dir_name:?}"),
            }
        }
        versions.sort();
        Ok(versions)
    }

    async fn walk_extensions(&self, callback: WalkCallback<'_>) -> Result<()> {
        let groups = self.grouped_extensions().await?;

        // Fetch latest manifests in parallel, one task per extension.
        // Failures are logged and the extension skipped so one broken
        // upload cannot take the listing down.
        let fetches = groups.iter().map(|((publisher, name), versions)| async move {
            match self.cached_manifest(publisher, name, &versions[0]).await {
                Ok(manifest) => Some((manifest, versions.clone())),
                Err(err) => {
                    warn!("skipping {publisher}.{name}: {err}");
                    None
                }
            }
        });
        let walked = future::join_all(fetches).await;

        // The callback is not assumed thread-safe; invoke in order.
        for (manifest, versions) in walked.into_iter().flatten() {
            callback(manifest, &versions)?;
        }
        Ok(())
    }
}
