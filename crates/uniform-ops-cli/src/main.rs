use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    // stdout carries reports; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = uniform_ops_cli::Cli::parse();
    uniform_ops_cli::run_cli(cli)
}
