//! Kiln CLI — idempotent declarative contract deployment.

use clap::Parser;
use kiln::cli::Cli;

fn main() {
    let cli = Cli::parse();
    kiln::logging::setup_logging(&cli.log_level, cli.json_logs);
    if let Err(e) = kiln::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
