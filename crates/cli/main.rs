use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod commands;
mod home;
mod render;
mod shutdown;

use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so command output on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let home = home::resolve_home(args.home)?;
    commands::dispatch(args.command, &home, args.output).await
}
