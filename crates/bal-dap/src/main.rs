use std::path::PathBuf;

use bal_dap::config::{AdapterConfig, DEFAULT_FRAME_LIMIT};
use clap::Parser;
use miette::miette;

/// Debug adapter that connects an IDE to the Ballerina remote debugger.
///
/// Speaks the Debug Adapter Protocol on stdin and stdout.
#[derive(Parser, Debug)]
#[command(name = "bal-dap", author, version, about, long_about = None)]
struct Cli {
    /// Number of stack frames per thread whose variables can be inspected
    #[arg(long, default_value_t = DEFAULT_FRAME_LIMIT, value_parser = clap::value_parser!(i64).range(1..))]
    frame_limit: i64,
    /// Ballerina installation used when a launch request does not name one
    #[arg(long, env = "BALLERINA_HOME")]
    runtime_home: Option<PathBuf>,
    /// Tracing filter, overridden by the BAL_DAP_LOG environment variable
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> AdapterConfig {
        let defaults = AdapterConfig::default();
        AdapterConfig {
            frame_limit: self.frame_limit,
            default_runtime_home: self.runtime_home,
            log_level: self.log_level.unwrap_or(defaults.log_level.clone()),
            ..defaults
        }
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    bal_dap::start(cli.into_config()).map_err(|e| miette!(e.to_string()))
}
