use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::server::{self, AppState};
use crate::storage::version::Version;
use crate::storage::{self, Storage};
use crate::vsix;

mod args;
mod config;

pub use args::{AddArgs, Cli, Commands, RemoveArgs, ServerArgs, StorageOpts};

use config::{apply_server_defaults, apply_storage_defaults, load_cli_config};

const DEFAULT_ADDRESS: &str = "127.0.0.1:3001";
const DEFAULT_MAX_PAGE_SIZE: i32 = 200;

/// Entry point for the CLI binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let cli_config = load_cli_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Some(Commands::Server(mut server_args)) => {
            if let Some(ref config) = cli_config {
                apply_server_defaults(config, &mut server_args);
            }
            runtime.block_on(run_server(server_args))
        }
        Some(Commands::Add(mut add_args)) => {
            if let Some(ref config) = cli_config {
                apply_storage_defaults(config, &mut add_args.storage);
            }
            runtime.block_on(run_add(add_args))
        }
        Some(Commands::Remove(mut remove_args)) => {
            if let Some(ref config) = cli_config {
                apply_storage_defaults(config, &mut remove_args.storage);
            }
            runtime.block_on(run_remove(remove_args))
        }
        Some(Commands::Version) => {
            println!("vsix-gallery {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let storage = storage::open_storage(&args.storage.storage_config()).await?;

    let addr: SocketAddr = args
        .address
        .as_deref()
        .unwrap_or(DEFAULT_ADDRESS)
        .parse()
        .context("parse listen address")?;
    let state = AppState::new(
        storage,
        args.max_page_size.unwrap_or(DEFAULT_MAX_PAGE_SIZE),
        args.base_path.as_deref().unwrap_or(""),
    )
    .with_rate_limit(
        args.rate_limit
            .unwrap_or(server::ratelimit::DEFAULT_LIMIT as i64),
    );

    // Cancel in-flight work before the grace period starts so
    // long-polling clients cannot keep the server alive.
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            signal.cancel();
        }
    });

    server::run(addr, state, shutdown).await
}

async fn run_add(args: AddArgs) -> Result<()> {
    let storage = storage::open_storage(&args.storage.storage_config()).await?;

    let mut failures = 0usize;
    for source in &args.sources {
        let batch = expand_source(source)?;
        for item in batch {
            match add_one(storage.as_ref(), &item).await {
                Ok(()) => {}
                Err(err) => {
                    error!("failed to add {item}: {err:#}");
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        bail!("failed to add {failures} extension(s)");
    }
    Ok(())
}

/// A directory source expands to every `.vsix` file directly inside
/// it; anything else is passed through as-is.
fn expand_source(source: &str) -> Result<Vec<String>> {
    let path = std::path::Path::new(source);
    if !path.is_dir() {
        return Ok(vec![source.to_string()]);
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.extension().is_some_and(|ext| ext == "vsix") {
            found.push(entry_path.display().to_string());
        }
    }
    found.sort();
    if found.is_empty() {
        bail!("{source} contains no .vsix files");
    }
    Ok(found)
}

async fn add_one(storage: &dyn Storage, source: &str) -> Result<()> {
    let bytes = vsix::read_vsix(source)
        .await
        .with_context(|| format!("read {source}"))?;
    let manifest = vsix::extract_manifest(&bytes)?;
    let location = storage.add_extension(&manifest, &bytes, Vec::new()).await?;

    let version = manifest.version()?;
    println!("Added {}@{version} to {location}", manifest.id());
    let dependencies = manifest.dependencies();
    if !dependencies.is_empty() {
        println!("  dependencies: {}", dependencies.join(", "));
    }
    let pack = manifest.extension_pack();
    if !pack.is_empty() {
        println!("  pack: {}", pack.join(", "));
    }
    Ok(())
}

async fn run_remove(args: RemoveArgs) -> Result<()> {
    let storage = storage::open_storage(&args.storage.storage_config()).await?;
    let (publisher, name, version) = storage::parse_extension_id(&args.id)?;

    if args.all && !version.is_empty() {
        bail!("cannot combine --all with a specific version");
    }
    if !args.all && version.is_empty() {
        let stored = storage.versions(&publisher, &name).await?;
        let listed: Vec<String> = stored.iter().map(Version::to_string).collect();
        bail!(
            "{} has {} version(s): {}; pass --all or one specific version",
            args.id,
            listed.len(),
            listed.join(", ")
        );
    }

    let target = if args.all {
        None
    } else {
        Some(version.parse::<Version>()?)
    };
    let removed = storage
        .remove_extension(&publisher, &name, target.as_ref())
        .await?;
    for version in removed {
        println!("Removed {publisher}.{name}@{version}");
    }
    Ok(())
}
