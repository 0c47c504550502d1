//! VSIX manifest (`extension.vsixmanifest`) and `package.json` parsing.
//!
//! The XML decode is tolerant: anything the document omits decodes to
//! its default and validation is a separate step, so a partially
//! valid manifest can still be inspected. `GalleryFlags` are
//! normalized to lower-case, comma+space separated form on parse.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::version::{TargetPlatform, Version};

/// Well-known asset types referenced by the gallery protocol.
pub mod asset_type {
    /// The `package.json` inside the VSIX.
    pub const MANIFEST: &str = "Microsoft.VisualStudio.Code.Manifest";
    /// The VSIX archive itself.
    pub const VSIX_PACKAGE: &str = "Microsoft.VisualStudio.Services.VSIXPackage";
    /// Detached signature archive served next to the VSIX.
    pub const VSIX_SIGNATURE: &str = "Microsoft.VisualStudio.Services.VsixSignature";
}

/// Well-known property keys carrying extension relationships.
pub mod property_key {
    /// Comma-separated `publisher.name` list of hard dependencies.
    pub const DEPENDENCIES: &str = "Microsoft.VisualStudio.Code.ExtensionDependencies";
    /// Comma-separated `publisher.name` list of pack members.
    pub const PACK: &str = "Microsoft.VisualStudio.Code.ExtensionPack";
}

/// Root of the `extension.vsixmanifest` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename = "PackageManifest", rename_all = "PascalCase")]
pub struct VsixManifest {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub installation: Installation,
    #[serde(default)]
    pub assets: Assets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub display_name: String,
    /// Wrapped because the element usually carries `xml:space`, which
    /// the XML decoder surfaces as a map rather than a bare string.
    #[serde(default)]
    pub description: PlainText,
    /// Comma-separated tag list as it appears in the document.
    #[serde(default)]
    pub tags: String,
    /// Comma-separated category list as it appears in the document.
    #[serde(default)]
    pub categories: String,
    #[serde(default)]
    pub gallery_flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

/// Element text content, tolerating attributes on the element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlainText {
    #[serde(rename = "$text", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "@Id", default)]
    pub id: String,
    #[serde(rename = "@Version", default)]
    pub version: String,
    #[serde(rename = "@Publisher", default)]
    pub publisher: String,
    #[serde(rename = "@TargetPlatform", default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "Property", default)]
    pub property: Vec<ManifestProperty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestProperty {
    #[serde(rename = "@Id", default)]
    pub id: String,
    #[serde(rename = "@Value", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Installation {
    #[serde(rename = "InstallationTarget", default)]
    pub installation_target: Vec<InstallationTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationTarget {
    #[serde(rename = "@Id", default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assets {
    #[serde(rename = "Asset", default)]
    pub asset: Vec<Asset>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Asset {
    #[serde(rename = "@Type", default)]
    pub asset_type: String,
    #[serde(rename = "@Path", default)]
    pub path: String,
    /// Only addressable assets may be served to clients.
    #[serde(rename = "@Addressable", default)]
    pub addressable: bool,
}

impl VsixManifest {
    /// `publisher.name`, the extension's identity and synthetic GUID.
    pub fn id(&self) -> String {
        format!(
            "{}.{}",
            self.metadata.identity.publisher, self.metadata.identity.id
        )
    }

    /// The version this manifest describes, including its platform.
    pub fn version(&self) -> Result<Version> {
        let target_platform = match self.metadata.identity.target_platform.as_deref() {
            Some(tag) => tag.parse()?,
            None => TargetPlatform::None,
        };
        Ok(Version::new(
            self.metadata.identity.version.clone(),
            target_platform,
        ))
    }

    /// Check the fields every stored manifest must carry.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.metadata.identity.publisher.is_empty() {
            missing.push("publisher");
        }
        if self.metadata.identity.id.is_empty() {
            missing.push("id");
        }
        if self.metadata.identity.version.is_empty() {
            missing.push("version");
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "manifest is missing required identity fields: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub fn asset(&self, asset_type: &str) -> Option<&Asset> {
        self.assets
            .asset
            .iter()
            .find(|a| a.asset_type == asset_type)
    }

    pub fn tags(&self) -> Vec<String> {
        split_list(&self.metadata.tags)
    }

    pub fn categories(&self) -> Vec<String> {
        split_list(&self.metadata.categories)
    }

    /// `publisher.name` ids listed under `ExtensionDependencies`.
    pub fn dependencies(&self) -> Vec<String> {
        self.property_list(property_key::DEPENDENCIES)
    }

    /// `publisher.name` ids listed under `ExtensionPack`.
    pub fn extension_pack(&self) -> Vec<String> {
        self.property_list(property_key::PACK)
    }

    fn property_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .properties
            .property
            .iter()
            .filter(|p| p.id == key)
            .flat_map(|p| split_list(&p.value))
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decode a manifest document, normalizing `GalleryFlags`.
///
/// Decoding is tolerant of missing fields; call
/// [`VsixManifest::validate`] to enforce required identity fields.
pub fn parse_manifest(bytes: &[u8]) -> Result<VsixManifest> {
    let text = String::from_utf8_lossy(bytes);
    let mut manifest: VsixManifest = quick_xml::de::from_str(&text)?;
    manifest.metadata.gallery_flags = normalize_flags(&manifest.metadata.gallery_flags);
    Ok(manifest)
}

/// Lower-case and comma+space separate a raw `GalleryFlags` value,
/// e.g. `"Public Preview"` becomes `"public, preview"`.
fn normalize_flags(raw: &str) -> String {
    raw.split_whitespace()
        .map(|flag| flag.to_lowercase())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The slice of `package.json` the storage layer cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageJson {
    /// Entry point for web extensions; its directory determines which
    /// archive entries must be extracted alongside the manifest.
    #[serde(default)]
    pub browser: Option<String>,
}

pub fn parse_package_json(bytes: &[u8]) -> Result<PackageJson> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> &'static str {
        r#"<?xml version="1.0" encoding="utf-8"?>
<PackageManifest Version="2.0.0" xmlns="http://schemas.microsoft.com/developer/vsx-schema/2011">
  <Metadata>
    <Identity Language="en-US" Id="zany" Version="3.0.0" Publisher="foo" />
    <DisplayName>Zany</DisplayName>
    <Description xml:space="preserve">foo bar baz qux</Description>
    <Tags>tag1,tag2</Tags>
    <Categories>cat1</Categories>
    <GalleryFlags>Public Preview</GalleryFlags>
    <Properties>
      <Property Id="Microsoft.VisualStudio.Code.Engine" Value="^1.57.0" />
      <Property Id="Microsoft.VisualStudio.Code.ExtensionDependencies" Value="foo.buz, bar.squigly" />
      <Property Id="Microsoft.VisualStudio.Code.ExtensionPack" Value="fred.thud" />
    </Properties>
  </Metadata>
  <Installation>
    <InstallationTarget Id="Microsoft.VisualStudio.Code" />
  </Installation>
  <Assets>
    <Asset Type="Microsoft.VisualStudio.Code.Manifest" Path="extension/package.json" Addressable="true" />
    <Asset Type="Microsoft.VisualStudio.Services.Icons.Default" Path="extension/icon.png" Addressable="true" />
    <Asset Type="Microsoft.VisualStudio.Code.Internal" Path="extension/internal.bin" Addressable="false" />
  </Assets>
</PackageManifest>"#
    }

    #[test]
    fn parses_identity_and_assets() {
        let manifest = parse_manifest(sample_manifest().as_bytes()).expect("parse manifest");
        assert_eq!(manifest.id(), "foo.zany");
        assert_eq!(manifest.metadata.identity.version, "3.0.0");
        assert_eq!(manifest.metadata.display_name, "Zany");
        assert_eq!(manifest.metadata.description.value, "foo bar baz qux");
        assert_eq!(manifest.tags(), vec!["tag1", "tag2"]);
        assert_eq!(manifest.categories(), vec!["cat1"]);
        assert_eq!(manifest.assets.asset.len(), 3);

        let manifest_asset = manifest
            .asset(asset_type::MANIFEST)
            .expect("package.json asset");
        assert_eq!(manifest_asset.path, "extension/package.json");
        assert!(manifest_asset.addressable);

        let internal = &manifest.assets.asset[2];
        assert!(!internal.addressable);
    }

    #[test]
    fn gallery_flags_are_normalized() {
        let manifest = parse_manifest(sample_manifest().as_bytes()).expect("parse manifest");
        assert_eq!(manifest.metadata.gallery_flags, "public, preview");
    }

    #[test]
    fn dependency_and_pack_properties_are_split() {
        let manifest = parse_manifest(sample_manifest().as_bytes()).expect("parse manifest");
        assert_eq!(manifest.dependencies(), vec!["foo.buz", "bar.squigly"]);
        assert_eq!(manifest.extension_pack(), vec!["fred.thud"]);
    }

    #[test]
    fn missing_identity_fields_fail_validation_but_parse() {
        let xml = r#"<PackageManifest><Metadata><Identity Id="zany" /></Metadata></PackageManifest>"#;
        let manifest = parse_manifest(xml.as_bytes()).expect("tolerant parse");
        let err = manifest.validate().expect_err("validation must fail");
        let message = err.to_string();
        assert!(message.contains("publisher"));
        assert!(message.contains("version"));
        assert!(!message.contains("id,"));
    }

    #[test]
    fn version_includes_target_platform() {
        let xml = r#"<PackageManifest><Metadata>
            <Identity Id="zany" Version="1.2.3" Publisher="foo" TargetPlatform="linux-x64" />
        </Metadata></PackageManifest>"#;
        let manifest = parse_manifest(xml.as_bytes()).expect("parse manifest");
        let version = manifest.version().expect("version");
        assert_eq!(version.to_string(), "1.2.3@linux-x64");
    }

    #[test]
    fn package_json_browser_entry() {
        let package = parse_package_json(br#"{"name":"zany","browser":"./dist/web/extension.js"}"#)
            .expect("parse package.json");
        assert_eq!(package.browser.as_deref(), Some("./dist/web/extension.js"));

        let package = parse_package_json(br#"{"name":"zany"}"#).expect("parse package.json");
        assert!(package.browser.is_none());
    }
}
