//! SDK features CLI - runs workflow SDK conformance features
//!
//! Each feature is a scripted workflow scenario that is executed against a
//! server, checked for its result and replayed against recorded histories.

use clap::Parser;
use commands::Commands;
use sdkfeatures::common::logging;
use sdkfeatures::{cli, commands};

#[derive(Parser)]
#[command(name = "sdk-features", about = "Workflow SDK feature runner")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = match &cli.command {
        Commands::Run(args) => logging::init_cli(&args.log_level, args.log_file.as_deref()),
        Commands::List => logging::init_cli("warn", None),
    };
    let guard = match guard {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = cli::dispatch(cli.command).await;
    // Flush the log file before exiting
    drop(guard);

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
