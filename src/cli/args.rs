use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::storage::StorageConfig;

/// Top-level CLI entrypoint for `vsix-gallery`.
#[derive(Parser, Debug)]
#[command(
    name = "vsix-gallery",
    about = "Self-hostable marketplace for VS Code compatible extensions",
    subcommand_required = false,
    arg_required_else_help = false
)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the marketplace HTTP server.
    Server(ServerArgs),
    /// Add one or more extensions to the storage.
    Add(AddArgs),
    /// Remove an extension from the storage.
    Remove(RemoveArgs),
    /// Print the version and exit.
    Version,
}

/// Storage selection shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct StorageOpts {
    /// Directory extensions are stored in.
    #[arg(long = "extensions-dir")]
    pub extensions_dir: Option<PathBuf>,

    /// Artifactory server URL to store extensions in instead of the
    /// local filesystem.
    #[arg(long = "artifactory")]
    pub artifactory: Option<String>,

    /// Artifactory repository name.
    #[arg(long = "repo")]
    pub repo: Option<String>,

    /// Artifactory access token.
    #[arg(long = "token", env = "ARTIFACTORY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Lifetime of the remote directory-listing cache, in seconds.
    #[arg(long = "list-cache-duration")]
    pub list_cache_duration: Option<u64>,

    /// Path to a base64-encoded ed25519 signing key. When set,
    /// extensions are served with detached signatures.
    #[arg(long = "signing-key")]
    pub signing_key: Option<PathBuf>,
}

impl StorageOpts {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            extensions_dir: self.extensions_dir.clone(),
            artifactory_uri: self.artifactory.clone(),
            artifactory_repo: self.repo.clone(),
            artifactory_token: self.token.clone(),
            list_cache_duration: Duration::from_secs(self.list_cache_duration.unwrap_or(60)),
            signing_key: self.signing_key.clone(),
        }
    }
}

/// Arguments specific to the `server` subcommand.
#[derive(Args, Debug)]
pub struct ServerArgs {
    #[command(flatten)]
    pub storage: StorageOpts,

    /// Address to listen on.
    #[arg(long = "address")]
    pub address: Option<String>,

    /// Largest page size a query may request.
    #[arg(long = "max-page-size")]
    pub max_page_size: Option<i32>,

    /// Path prefix under which the server is reachable behind a
    /// reverse proxy.
    #[arg(long = "base-path")]
    pub base_path: Option<String>,

    /// Requests allowed per client per endpoint per minute; zero or
    /// negative disables rate limiting.
    #[arg(long = "rate-limit")]
    pub rate_limit: Option<i64>,
}

/// Arguments specific to the `add` subcommand.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// VSIX files, http(s) URLs, or directories of VSIX files.
    #[arg(required = true)]
    pub sources: Vec<String>,

    #[command(flatten)]
    pub storage: StorageOpts,
}

/// Arguments specific to the `remove` subcommand.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Extension to remove, as `publisher.name` or
    /// `publisher.name@version`.
    pub id: String,

    /// Remove every stored version.
    #[arg(long = "all")]
    pub all: bool,

    #[command(flatten)]
    pub storage: StorageOpts,
}
