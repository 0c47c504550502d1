//! Signing decorator.
//!
//! Wraps any backend and adds detached-signature support. At ingest
//! an unsigned signature manifest (sizes and SHA-256 digests of the
//! VSIX and every entry inside it) is stored next to the other
//! assets. The signed archive itself is synthesized lazily: opening
//! `extension.sigzip` signs the stored manifest with the configured
//! ed25519 key and streams back a zip of manifest plus signature, so
//! ingest never needs the key and unsigned manifests can sit in
//! storage indefinitely.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::Result;
use crate::manifest::{asset_type, Asset, VsixManifest};
use crate::storage::version::Version;
use crate::storage::{ExtraFile, FileReader, Storage, WalkCallback};
use crate::vsix;

/// Unsigned signature manifest stored next to the extracted assets.
pub const SIGNATURE_MANIFEST_FILE: &str = ".signature.manifest";
/// Virtual asset clients download to obtain the signature archive.
pub const SIGNATURE_ZIP_FILE: &str = "extension.sigzip";
/// Detached signature entry inside the signature archive.
const SIGNATURE_FILE: &str = ".signature.p7s";

/// Digest record for the VSIX package or one of its entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDigest {
    pub size: u64,
    pub digests: Digests,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digests {
    pub sha256: String,
}

/// JSON document enumerating the VSIX and all of its entries; the
/// input to the detached signature. Entry keys are base64-encoded
/// relative paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureManifest {
    pub package: FileDigest,
    pub entries: BTreeMap<String, FileDigest>,
}

/// Build the signature manifest for a VSIX archive.
pub fn signature_manifest(vsix_bytes: &[u8]) -> Result<SignatureManifest> {
    let mut entries = BTreeMap::new();
    vsix::walk(vsix_bytes, |name, _, reader| {
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents)?;
        entries.insert(BASE64.encode(name), digest(&contents));
        Ok(())
    })?;
    Ok(SignatureManifest {
        package: digest(vsix_bytes),
        entries,
    })
}

fn digest(contents: &[u8]) -> FileDigest {
    FileDigest {
        size: contents.len() as u64,
        digests: Digests {
            sha256: format!("{:x}", Sha256::digest(contents)),
        },
    }
}

/// Load a base64-encoded 32-byte ed25519 seed from disk.
pub fn load_signing_key(path: &Path) -> anyhow::Result<SigningKey> {
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("read signing key {}", path.display()))?;
    let bytes = BASE64
        .decode(encoded.trim())
        .with_context(|| format!("decode signing key {}", path.display()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be a 32 byte ed25519 seed"))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub struct SignatureStorage {
    inner: Arc<dyn Storage>,
    key: SigningKey,
}

impl SignatureStorage {
    pub fn new(inner: Arc<dyn Storage>, key: SigningKey) -> Self {
        Self { inner, key }
    }

    /// Sign the stored signature manifest and zip it together with
    /// the detached signature.
    async fn build_signature_zip(&self, sigzip_path: &str) -> Result<Vec<u8>> {
        let manifest_path = match sigzip_path.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{SIGNATURE_MANIFEST_FILE}"),
            None => SIGNATURE_MANIFEST_FILE.to_string(),
        };

        let mut reader = self.inner.open(&manifest_path).await?;
        let mut manifest_bytes = Vec::new();
        reader.read_to_end(&mut manifest_bytes).await?;

        let signature = self.key.sign(&manifest_bytes);

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(SIGNATURE_MANIFEST_FILE, SimpleFileOptions::default())?;
        writer.write_all(&manifest_bytes)?;
        writer.start_file(SIGNATURE_FILE, SimpleFileOptions::default())?;
        writer.write_all(&signature.to_bytes())?;
        Ok(writer.finish()?.into_inner())
    }
}

#[async_trait]
impl Storage for SignatureStorage {
    async fn add_extension(
        &self,
        manifest: &VsixManifest,
        vsix_bytes: &[u8],
        mut extra: Vec<ExtraFile>,
    ) -> Result<String> {
        let signature = signature_manifest(vsix_bytes)?;
        extra.push(ExtraFile {
            path: SIGNATURE_MANIFEST_FILE.to_string(),
            contents: serde_json::to_vec(&signature)?,
        });
        self.inner.add_extension(manifest, vsix_bytes, extra).await
    }

    async fn open(&self, path: &str) -> Result<FileReader> {
        if path.ends_with("p7s.sig") {
            // Clients require the file to exist; its contents do not
            // matter.
            return Ok(Box::new(Cursor::new(Vec::new())));
        }
        if path.ends_with(SIGNATURE_ZIP_FILE) {
            let archive = self.build_signature_zip(path).await?;
            return Ok(Box::new(Cursor::new(archive)));
        }
        self.inner.open(path).await
    }

    async fn manifest(
        &self,
        publisher: &str,
        name: &str,
        version: &Version,
    ) -> Result<Arc<VsixManifest>> {
        let manifest = self.inner.manifest(publisher, name, version).await?;
        let mut manifest = (*manifest).clone();
        manifest.assets.asset.push(Asset {
            asset_type: asset_type::VSIX_SIGNATURE.to_string(),
            path: SIGNATURE_ZIP_FILE.to_string(),
            addressable: true,
        });
        Ok(Arc::new(manifest))
    }

    async fn remove_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Vec<Version>> {
        self.inner.remove_extension(publisher, name, version).await
    }

    async fn versions(&self, publisher: &str, name: &str) -> Result<Vec<Version>> {
        self.inner.versions(publisher, name).await
    }

    async fn walk_extensions(&self, callback: WalkCallback<'_>) -> Result<()> {
        self.inner.walk_extensions(callback).await
    }
}
