//! Local filesystem backend.
//!
//! Extensions live under `<root>/<publisher>/<name>/<version-dir>/`
//! with the manifest, the extracted addressable assets, and the VSIX
//! archive itself. The directory tree is the database: listing a
//! version is a `read_dir`, opening an asset is a file open.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::manifest::{self, VsixManifest};
use crate::storage::version::Version;
use crate::storage::{
    extension_dir, extract_set, vsix_file_name, with_package_asset, ExtraFile, FileReader, Storage,
    WalkCallback,
};
use crate::vsix;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Open (or create) an extension root directory.
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn version_dir(&self, publisher: &str, name: &str, version: &Version) -> PathBuf {
        self.root
            .join(publisher)
            .join(name)
            .join(version.to_string())
    }

    fn list_versions(&self, publisher: &str, name: &str) -> Result<Vec<Version>> {
        let dir = self.root.join(publisher).join(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("extension {publisher}.{name}")))
            }
            Err(err) => return Err(err.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let dir_name = dir_name.to_string_lossy();
            match dir_name.parse::<Version>() {
                Ok(version) => versions.push(version),
                Err(_) => debug!("skipping unrecognized version directory {dir_name:?}"),
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Remove a directory and prune now-empty parents up to the root.
    fn remove_and_prune(&self, dir: &Path) -> Result<()> {
        fs::remove_dir_all(dir)?;
        let mut parent = dir.parent();
        while let Some(current) = parent {
            if current == self.root {
                break;
            }
            if fs::read_dir(current)?.next().is_some() {
                break;
            }
            fs::remove_dir(current)?;
            parent = current.parent();
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
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

        let dir = self.version_dir(publisher, name, &version);
        fs::create_dir_all(&dir)?;

        let wanted: HashSet<String> = extract_set(manifest, vsix_bytes)?;
        vsix::walk(vsix_bytes, |entry, _, reader| {
            if !wanted.contains(entry) {
                return Ok(());
            }
            let target = dir.join(entry);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            std::io::copy(reader, &mut out)?;
            Ok(())
        })?;

        fs::write(dir.join(vsix_file_name(publisher, name, &version)), vsix_bytes)?;

        for file in extra {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &file.contents)?;
        }

        Ok(dir.display().to_string())
    }

    async fn open(&self, path: &str) -> Result<FileReader> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::NotFound(path.to_string()));
        }
        let file = match tokio::fs::File::open(self.root.join(path)).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Box::new(file))
    }

    async fn manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>> {
        let path = self
            .version_dir(publisher, name, version)
            .join(vsix::MANIFEST_ENTRY);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "manifest for {}",
                    extension_dir(publisher, name, version)
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let parsed = manifest::parse_manifest(&bytes)?;
        Ok(Arc::new(with_package_asset(
            parsed, publisher, name, version,
        )))
    }

    async fn remove_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Vec<Version>> {
        match version {
            None => {
                let versions = self.list_versions(publisher, name)?;
                if versions.is_empty() {
                    return Err(Error::NotFound(format!("extension {publisher}.{name}")));
                }
                self.remove_and_prune(&self.root.join(publisher).join(name))?;
                Ok(versions)
            }
            Some(version) if !version.is_universal() => Err(Error::Validation(
                "removing a specific target platform is not supported".to_string(),
            )),
            Some(version) => {
                let dir = self.version_dir(publisher, name, version);
                if !dir.is_dir() {
                    return Err(Error::NotFound(extension_dir(publisher, name, version)));
                }
                self.remove_and_prune(&dir)?;
                Ok(vec![version.clone()])
            }
        }
    }

    async fn versions(&self, publisher: &str, name: &str) -> Result<Vec<Version>> {
        self.list_versions(publisher, name)
    }

    async fn walk_extensions(&self, callback: WalkCallback<'_>) -> Result<()> {
        let mut publishers = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                publishers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        publishers.sort();

        for publisher in publishers {
            let publisher_dir = self.root.join(&publisher);
            let mut names = Vec::new();
            for entry in fs::read_dir(&publisher_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();

            for name in names {
                let versions = match self.list_versions(&publisher, &name) {
                    Ok(versions) if !versions.is_empty() => versions,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("skipping {publisher}.{name}: {err}");
                        continue;
                    }
                };
                let manifest = match self.manifest(&publisher, &name, &versions[0]).await {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!("skipping {publisher}.{name}: {err}");
                        continue;
                    }
                };
                callback(manifest, &versions)?;
            }
        }
        Ok(())
    }
}
