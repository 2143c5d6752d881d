use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Aggregator host to push samples to.
    #[arg(short, long)]
    pub remote_host: Option<String>,
    /// Aggregator control-protocol port.
    #[arg(short = 'p', long)]
    pub remote_port: Option<u16>,
    /// Seconds between sample pushes.
    #[arg(short, long)]
    pub interval: Option<f64>,
    /// This host's current job id (omit if idle).
    #[arg(short, long)]
    pub job: Option<String>,
    /// YAML config file.
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
