//! Conductor - operator entry point.

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    conductor::logging::init(cli.verbose);

    if let Err(err) = cli::execute(cli).await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
