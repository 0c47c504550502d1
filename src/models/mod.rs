//! Wire types for the Visual Studio Marketplace gallery protocol.
//!
//! These types form the stable JSON surface consumed by editor
//! clients: the `extensionquery` request/response envelopes and the
//! extension metadata embedded in results. Field names follow the
//! upstream camelCase convention.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Numeric criterion types understood by the query engine.
///
/// The numeric codes are fixed by the gallery protocol; unknown codes
/// are accepted and simply never match.
pub mod filter_type {
    /// Case-insensitive membership in the extension's tag list.
    pub const TAG: u32 = 1;
    /// Case-insensitive equality with `publisher.name`, which doubles
    /// as the extension's synthetic GUID.
    pub const EXTENSION_ID: u32 = 4;
    /// Case-insensitive membership in the extension's categories.
    pub const CATEGORY: u32 = 5;
    /// Case-insensitive equality with `publisher.name`.
    pub const EXTENSION_NAME: u32 = 7;
    /// AND-combined install target; anything other than
    /// `Microsoft.VisualStudio.Code` rejects the extension.
    pub const TARGET: u32 = 8;
    /// Accepted for compatibility; never matches.
    pub const FEATURED: u32 = 9;
    /// Fuzzy full-text search over name, publisher, and description.
    pub const SEARCH_TEXT: u32 = 10;
    /// Accepted for compatibility; there is no unpublished state.
    pub const EXCLUDE_WITH_FLAGS: u32 = 12;
}

/// Sort keys understood by the query engine. Codes 1, 4, 5, 6, and 12
/// are accepted and treated as `TITLE`.
pub mod sort_by {
    pub const NONE_OR_RELEVANCE: u32 = 0;
    pub const TITLE: u32 = 2;
    pub const PUBLISHER_NAME: u32 = 3;
}

/// Sort directions for a filter.
pub mod sort_order {
    pub const DEFAULT: u32 = 0;
    pub const ASCENDING: u32 = 1;
    pub const DESCENDING: u32 = 2;
}

bitflags! {
    /// Flag bitfield controlling response enrichment.
    ///
    /// Flags outside the supported set are accepted and ignored, so
    /// requests are decoded with `from_bits_truncate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        const INCLUDE_VERSIONS = 0x1;
        const INCLUDE_FILES = 0x2;
        const INCLUDE_CATEGORY_AND_TAGS = 0x4;
        const INCLUDE_VERSION_PROPERTIES = 0x10;
        const INCLUDE_ASSET_URI = 0x80;
        const INCLUDE_LATEST_VERSION_ONLY = 0x200;
        /// Only meaningful as an `ExcludeWithFlags` criterion value;
        /// produces no behavior in production.
        const UNPUBLISHED = 0x1000;
    }
}

impl QueryFlags {
    /// True when any flag that requires the version list is set.
    pub fn wants_versions(self) -> bool {
        self.intersects(
            Self::INCLUDE_VERSIONS
                | Self::INCLUDE_FILES
                | Self::INCLUDE_VERSION_PROPERTIES
                | Self::INCLUDE_ASSET_URI
                | Self::INCLUDE_LATEST_VERSION_ONLY,
        )
    }
}

/// Body of `POST /api/extensionquery`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub flags: u32,
}

/// A single filter within a query request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub page_number: i32,
    #[serde(default)]
    pub page_size: i32,
    #[serde(default)]
    pub sort_by: u32,
    #[serde(default)]
    pub sort_order: u32,
}

/// One criterion inside a filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub filter_type: u32,
    #[serde(default)]
    pub value: Option<String>,
}

impl Criterion {
    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }
}

/// Top-level response for `POST /api/extensionquery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
}

/// One result set per filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub extensions: Vec<Extension>,
    pub result_metadata: Vec<ResultMetadata>,
}

impl QueryResult {
    /// Wrap a page of extensions with the standard `ResultCount`
    /// metadata block reporting the pre-pagination match count.
    pub fn with_total(extensions: Vec<Extension>, total: usize) -> Self {
        Self {
            extensions,
            result_metadata: vec![ResultMetadata {
                metadata_type: "ResultCount".to_string(),
                metadata_items: vec![MetadataItem {
                    name: "TotalCount".to_string(),
                    count: total,
                }],
            }],
        }
    }
}

/// Metadata block attached to a query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub metadata_type: String,
    pub metadata_items: Vec<MetadataItem>,
}

/// A single named count inside a metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    pub count: usize,
}

/// An extension as reported to gallery clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    /// Synthetic GUID; this marketplace uses `publisher.name`.
    pub extension_id: String,
    pub extension_name: String,
    pub display_name: String,
    #[serde(default)]
    pub short_description: String,
    pub publisher: Publisher,
    /// Normalized gallery flags, e.g. `"public, preview"`.
    #[serde(default)]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ExtVersion>,
}

/// Publisher block inside an extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publisher {
    /// Synthetic GUID; mirrors the publisher name.
    pub publisher_id: String,
    pub publisher_name: String,
    pub display_name: String,
}

impl Publisher {
    pub fn new(name: &str) -> Self {
        Self {
            publisher_id: name.to_string(),
            publisher_name: name.to_string(),
            display_name: name.to_string(),
        }
    }
}

/// A single version entry inside an extension result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtVersion {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ExtFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_asset_uri: Option<String>,
}

/// A downloadable file belonging to a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtFile {
    pub asset_type: String,
    pub source: String,
}

/// Free-form `{key, value}` property attached to a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// JSON error envelope returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    pub detail: String,
    pub request_id: String,
}
