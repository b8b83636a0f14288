use bqbridge::cli::Cli;
use bqbridge::{config, server, verbose};
use clap::Parser;
use std::process;

#[tokio::main]
async fn main() {
    // Load .env file (optional, ignore if missing)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let app_config = match config::load(&cli) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    };

    verbose::init(app_config.verbose);

    if let Err(err) = server::run(app_config).await {
        tracing::error!(error = %err, "server stopped");
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
