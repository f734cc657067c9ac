use clap::Parser;
use couchvault::cli::{self, Cli};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors are configuration errors; --help and --version are not.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    tracing::debug!("couchvault {} starting", env!("CARGO_PKG_VERSION"));

    let result = cli.run().await;
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    ExitCode::from(cli::exit_code(&result))
}
