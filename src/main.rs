mod cli;
mod error;
mod manifest;
mod models;
mod search;
mod server;
mod storage;
mod vsix;

fn main() -> anyhow::Result<()> {
    cli::run()
}
