//! Zip helpers for VSIX archives plus the VSIX source reader.
//!
//! Archives are always held in memory; the helpers provide random
//! access to single entries and a streaming walk used by selective
//! extraction and signature-manifest generation.

use std::io::{Cursor, Read};

use futures::StreamExt;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::manifest::{self, VsixManifest};

/// Name of the manifest entry every VSIX must contain.
pub const MANIFEST_ENTRY: &str = "extension.vsixmanifest";

/// Largest VSIX accepted from a remote source.
const MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Open an in-memory archive for random access.
pub fn open_archive(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    Ok(ZipArchive::new(Cursor::new(bytes))?)
}

/// Read a single entry out of an in-memory archive.
pub fn read_entry(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut archive = open_archive(bytes)?;
    let mut file = archive
        .by_name(name)
        .map_err(|_| Error::NotFound(format!("archive entry {name}")))?;
    let mut contents = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Walk every file entry in the archive, streaming each to `f`.
///
/// Directory entries are skipped. The callback returning an error
/// aborts the walk.
pub fn walk<F>(bytes: &[u8], mut f: F) -> Result<()>
where
    F: FnMut(&str, u64, &mut dyn Read) -> Result<()>,
{
    let mut archive = open_archive(bytes)?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let size = file.size();
        f(&name, size, &mut file)?;
    }
    Ok(())
}

/// Parse the `extension.vsixmanifest` entry of a VSIX archive.
pub fn extract_manifest(vsix: &[u8]) -> Result<VsixManifest> {
    let bytes = read_entry(vsix, MANIFEST_ENTRY)?;
    manifest::parse_manifest(&bytes)
}

/// Read a VSIX from a local path or an http(s) URL.
///
/// Remote responses are capped at 100 MB and non-2xx statuses are
/// errors.
pub async fn read_vsix(source: &str) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        download_vsix(source).await
    } else {
        Ok(tokio::fs::read(source).await?)
    }
}

async fn download_vsix(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Transient(format!(
            "GET {url} returned status {status}"
        )));
    }
    if response.content_length().unwrap_or(0) > MAX_DOWNLOAD_BYTES {
        return Err(Error::Validation(format!(
            "{url} exceeds the {MAX_DOWNLOAD_BYTES} byte download limit"
        )));
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len() as u64 + chunk.len() as u64 > MAX_DOWNLOAD_BYTES {
            return Err(Error::Validation(format!(
                "{url} exceeds the {MAX_DOWNLOAD_BYTES} byte download limit"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
pub mod testutil {
    //! Shared helper for building VSIX fixtures in unit tests.

    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build an in-memory zip from `(entry name, contents)` pairs.
    pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(contents).expect("write zip entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }
}
