//! Query evaluation over a storage backend.
//!
//! `run_query` is the "query as a function" entry point used by the
//! HTTP surface: it walks the storage for candidates, applies the
//! filter's criteria, ranks and sorts, paginates, and re-enters
//! storage for per-version enrichment as directed by the request
//! flags. `resolve_asset` is the companion lookup that turns an
//! asset request into a servable `/files/...` path.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::manifest::{asset_type, VsixManifest};
use crate::models::{
    filter_type, sort_by, sort_order, ExtFile, Extension, Filter, Property, Publisher,
    QueryFlags, QueryResult, ExtVersion,
};
use crate::search::query::{self, SearchCorpus, SearchToken};
use crate::storage::version::{TargetPlatform, Version};
use crate::storage::Storage;

/// The only installation target this marketplace serves.
pub const CODE_TARGET: &str = "Microsoft.VisualStudio.Code";

/// Alias accepted in asset URLs for the VSIX package asset.
const VSPACKAGE_ALIAS: &str = "vspackage";

/// Page size substituted when a filter asks for zero or less.
const DEFAULT_PAGE_SIZE: usize = 50;

struct Candidate {
    manifest: Arc<VsixManifest>,
    versions: Vec<Version>,
    publisher: String,
    name: String,
    /// Fuzzy match distances, sorted ascending for comparison.
    distances: Vec<usize>,
}

/// Evaluate one filter against the storage and build the result set.
pub async fn run_query(
    storage: &dyn Storage,
    filter: &Filter,
    flags: QueryFlags,
    base_url: &str,
) -> Result<QueryResult> {
    let mut candidates = collect_candidates(storage, filter).await?;
    sort_candidates(&mut candidates, filter.sort_by, filter.sort_order);

    let total = candidates.len();
    let page = paginate(candidates, filter.page_number, filter.page_size);

    let mut extensions = Vec::with_capacity(page.len());
    for candidate in page {
        extensions.push(enrich(storage, candidate, flags, base_url).await?);
    }
    Ok(QueryResult::with_total(extensions, total))
}

/// Walk the storage and keep every extension the filter retains.
///
/// Criteria are OR-combined except `Target`, which must match when
/// present. An extension whose only criterion is `Target` is
/// retained; otherwise at least one non-target criterion must fire.
/// A filter with no criteria retains everything.
async fn collect_candidates(storage: &dyn Storage, filter: &Filter) -> Result<Vec<Candidate>> {
    let criteria = &filter.criteria;
    let has_target = criteria
        .iter()
        .any(|c| c.filter_type == filter_type::TARGET);
    let only_target = has_target
        && criteria
            .iter()
            .all(|c| c.filter_type == filter_type::TARGET);

    let mut candidates = Vec::new();
    storage
        .walk_extensions(&mut |manifest, versions| {
            let publisher = manifest.metadata.identity.publisher.clone();
            let name = manifest.metadata.identity.id.clone();
            let id = manifest.id();
            let description = manifest.metadata.description.value.clone();

            let mut matched = false;
            let mut distances = Vec::new();
            for criterion in criteria {
                match criterion.filter_type {
                    filter_type::TARGET => {
                        if criterion.value() != CODE_TARGET {
                            return Ok(());
                        }
                    }
                    filter_type::TAG => {
                        if contains_fold(&manifest.tags(), criterion.value()) {
                            matched = true;
                        }
                    }
                    filter_type::CATEGORY => {
                        if contains_fold(&manifest.categories(), criterion.value()) {
                            matched = true;
                        }
                    }
                    filter_type::EXTENSION_ID | filter_type::EXTENSION_NAME => {
                        if id.eq_ignore_ascii_case(criterion.value()) {
                            matched = true;
                        }
                    }
                    filter_type::SEARCH_TEXT => {
                        let tokens: Vec<SearchToken> = query::tokenize(criterion.value());
                        let corpus = SearchCorpus {
                            name: &name,
                            publisher: &publisher,
                            description: &description,
                        };
                        if let Some(found) = query::rank(&tokens, &corpus) {
                            distances.extend(found);
                            matched = true;
                        }
                    }
                    // Featured listings and unpublished extensions do
                    // not exist here.
                    filter_type::FEATURED | filter_type::EXCLUDE_WITH_FLAGS => {}
                    _ => {}
                }
            }

            if criteria.is_empty() || only_target || matched {
                let mut distances = distances;
                distances.sort_unstable();
                candidates.push(Candidate {
                    manifest,
                    versions: versions.to_vec(),
                    publisher,
                    name,
                    distances,
                });
            }
            Ok(())
        })
        .await?;
    Ok(candidates)
}

fn contains_fold(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|item| item.eq_ignore_ascii_case(needle))
}

fn sort_candidates(candidates: &mut [Candidate], key: u32, order: u32) {
    candidates.sort_by(|a, b| {
        let ordering = match key {
            sort_by::NONE_OR_RELEVANCE => compare_relevance(a, b),
            sort_by::PUBLISHER_NAME => a
                .publisher
                .cmp(&b.publisher)
                .then_with(|| a.name.cmp(&b.name)),
            // Title, and the unsupported keys that share its
            // semantics.
            _ => a.name.cmp(&b.name),
        };
        if order == sort_order::ASCENDING {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

/// Lower distances are more relevant. On a per-element tie the longer
/// vector (more matches) wins; a full tie falls back to name order.
fn compare_relevance(a: &Candidate, b: &Candidate) -> Ordering {
    for (left, right) in a.distances.iter().zip(b.distances.iter()) {
        match left.cmp(right) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    b.distances
        .len()
        .cmp(&a.distances.len())
        .then_with(|| a.name.cmp(&b.name))
}

/// Pages are 1-indexed; non-positive numbers and sizes fall back to
/// the first page and the default size. The slice is applied after
/// sorting.
fn paginate(candidates: Vec<Candidate>, page_number: i32, page_size: i32) -> Vec<Candidate> {
    let page_number = if page_number <= 0 { 1 } else { page_number as usize };
    let page_size = if page_size <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size as usize
    };

    let start = (page_number - 1).saturating_mul(page_size);
    if start >= candidates.len() {
        return Vec::new();
    }
    let end = candidates.len().min(start + page_size);
    candidates
        .into_iter()
        .skip(start)
        .take(end - start)
        .collect()
}

/// Build the response extension for one candidate, re-entering the
/// storage for per-version manifests as the flags require.
async fn enrich(
    storage: &dyn Storage,
    candidate: Candidate,
    flags: QueryFlags,
    base_url: &str,
) -> Result<Extension> {
    let manifest = &candidate.manifest;
    let mut extension = Extension {
        extension_id: manifest.id(),
        extension_name: candidate.name.clone(),
        display_name: manifest.metadata.display_name.clone(),
        short_description: manifest.metadata.description.value.clone(),
        publisher: Publisher::new(&candidate.publisher),
        flags: manifest.metadata.gallery_flags.clone(),
        tags: manifest.tags(),
        categories: manifest.categories(),
        versions: Vec::new(),
    };

    if flags.wants_versions() {
        let versions: &[Version] = if flags.contains(QueryFlags::INCLUDE_LATEST_VERSION_ONLY) {
            &candidate.versions[..candidate.versions.len().min(1)]
        } else {
            &candidate.versions
        };

        for version in versions {
            let version_manifest = storage
                .manifest(&candidate.publisher, &candidate.name, version)
                .await?;
            let mut entry = ExtVersion {
                version: version.version.clone(),
                target_platform: version.platform_for_response(),
                ..ExtVersion::default()
            };
            if flags.contains(QueryFlags::INCLUDE_FILES) {
                for asset in &version_manifest.assets.asset {
                    if !asset.addressable {
                        continue;
                    }
                    entry.files.push(ExtFile {
                        asset_type: asset.asset_type.clone(),
                        source: format!(
                            "{base_url}/files/{}/{}/{}/{}",
                            candidate.publisher, candidate.name, version, asset.path
                        ),
                    });
                }
            }
            if flags.contains(QueryFlags::INCLUDE_VERSION_PROPERTIES) {
                entry.properties = version_manifest
                    .metadata
                    .properties
                    .property
                    .iter()
                    .map(|p| Property {
                        key: p.id.clone(),
                        value: p.value.clone(),
                    })
                    .collect();
            }
            if flags.contains(QueryFlags::INCLUDE_ASSET_URI) {
                let asset_uri = format!(
                    "{base_url}/assets/{}/{}/{}",
                    candidate.publisher, candidate.name, version
                );
                entry.fallback_asset_uri = Some(asset_uri.clone());
                entry.asset_uri = Some(asset_uri);
            }
            extension.versions.push(entry);
        }
    }

    // Tags and categories were needed for filtering; only surface
    // them when asked.
    if !flags.contains(QueryFlags::INCLUDE_CATEGORY_AND_TAGS) {
        extension.tags.clear();
        extension.categories.clear();
    }

    Ok(extension)
}

/// Resolve an asset request to the `/files/...` path serving it.
///
/// `vspackage` aliases the VSIX package asset. When the version
/// directory has no platform segment and the request names a target
/// platform, the platform is spliced into the version directory.
pub async fn resolve_asset(
    storage: &dyn Storage,
    publisher: &str,
    name: &str,
    version_dir: &str,
    requested_type: &str,
    target_platform: Option<&str>,
) -> Result<String> {
    let mut version: Version = version_dir.parse()?;
    if version.target_platform == TargetPlatform::None {
        if let Some(platform) = target_platform {
            if let Ok(platform) = platform.parse::<TargetPlatform>() {
                version.target_platform = platform;
            }
        }
    }

    let wanted_type = if requested_type.eq_ignore_ascii_case(VSPACKAGE_ALIAS) {
        asset_type::VSIX_PACKAGE
    } else {
        requested_type
    };

    let manifest = storage.manifest(publisher, name, &version).await?;
    let asset = manifest
        .assets
        .asset
        .iter()
        .find(|asset| asset.asset_type == wanted_type && asset.addressable)
        .ok_or_else(|| {
            Error::NotFound(format!("asset {wanted_type} for {publisher}.{name}@{version}"))
        })?;

    Ok(format!(
        "/files/{publisher}/{name}/{version}/{}",
        asset.path
    ))
}
