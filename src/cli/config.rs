//! Optional TOML configuration file supplying flag defaults.
//!
//! The file is looked up at `$VSIX_GALLERY_CONFIG`, then
//! `vsix-gallery.toml` in the working directory. Values only fill
//! flags the user did not pass; the command line always wins.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::args::{ServerArgs, StorageOpts};

const CONFIG_ENV: &str = "VSIX_GALLERY_CONFIG";
const CONFIG_FILE: &str = "vsix-gallery.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    pub extensions_dir: Option<PathBuf>,
    pub artifactory: Option<String>,
    pub repo: Option<String>,
    pub list_cache_duration: Option<u64>,
    pub signing_key: Option<PathBuf>,
    pub address: Option<String>,
    pub max_page_size: Option<i32>,
    pub base_path: Option<String>,
    pub rate_limit: Option<i64>,
}

/// Load the config file if one exists.
pub fn load_cli_config() -> Result<Option<CliConfig>> {
    let path = match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(CONFIG_FILE),
    };
    if !path.is_file() {
        return Ok(None);
    }
    load_from(&path).map(Some)
}

fn load_from(path: &Path) -> Result<CliConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse config file {}", path.display()))
}

pub fn apply_storage_defaults(config: &CliConfig, opts: &mut StorageOpts) {
    if opts.extensions_dir.is_none() && opts.artifactory.is_none() {
        opts.extensions_dir = config.extensions_dir.clone();
        opts.artifactory = config.artifactory.clone();
    }
    if opts.repo.is_none() {
        opts.repo = config.repo.clone();
    }
    if opts.list_cache_duration.is_none() {
        opts.list_cache_duration = config.list_cache_duration;
    }
    if opts.signing_key.is_none() {
        opts.signing_key = config.signing_key.clone();
    }
}

pub fn apply_server_defaults(config: &CliConfig, args: &mut ServerArgs) {
    apply_storage_defaults(config, &mut args.storage);
    if args.address.is_none() {
        args.address = config.address.clone();
    }
    if args.max_page_size.is_none() {
        args.max_page_size = config.max_page_size;
    }
    if args.base_path.is_none() {
        args.base_path = config.base_path.clone();
    }
    if args.rate_limit.is_none() {
        args.rate_limit = config.rate_limit;
    }
}
