//! Shardform CLI: synthesize and deploy size-limited resource documents.

use clap::Parser;
use shardform::logging::{init_logging, LoggingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "shardform",
    version,
    about = "Split resource graphs into size-limited deployment documents and deploy them tier by tier"
)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: shardform::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    let mut logging = LoggingConfig::from_verbosity(cli.verbose, cli.quiet);
    if cli.log_json {
        logging.format = "json".to_string();
    }
    if let Err(e) = init_logging(&logging) {
        eprintln!("warning: {}", e);
    }
    if let Err(e) = shardform::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
