use std::path::PathBuf;

use clap::Parser;

/// Mirrors `xltop.c`'s `getopt_long` table (`c`, `h`, `i`, `k`, `l`, `p`,
/// `r`, `s`), translated to `clap` derive the way `ebeans`'s `args.rs` does.
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// YAML config file.
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// Seconds between refreshes.
    #[arg(short, long)]
    pub interval: Option<f64>,
    /// Opaque sort key, forwarded to the aggregator verbatim.
    #[arg(short = 'k', long)]
    pub sort_key: Option<String>,
    /// Maximum number of rows to display.
    #[arg(short, long)]
    pub limit: Option<usize>,
    /// Aggregator's HTTP port.
    #[arg(short = 'p', long)]
    pub remote_port: Option<u16>,
    /// Aggregator host.
    #[arg(short, long)]
    pub remote_host: Option<String>,
    /// Show accumulated sums rather than rates; forwarded verbatim.
    #[arg(short, long, default_value_t)]
    pub sum: bool,
    /// `<type>[:<name>]` selectors (default: `ALL`/`ALL` on both axes).
    pub selectors: Vec<String>,
}
