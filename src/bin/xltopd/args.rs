use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Fields are `Option<T>` rather than using `default_value_t`: an absent
/// flag must be distinguishable from an explicit one so `xltop::config`'s
/// overlay can fall through to the config file before the hard default
/// (§8 property 13).
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address the HTTP and control surfaces listen on.
    #[arg(short, long)]
    pub listen: Option<IpAddr>,
    /// HTTP port serving the `/top`, `/clus`, `/fs`, ... endpoints (§6).
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Control-protocol TCP port agents push `%sample` frames to.
    #[arg(short = 'P', long)]
    pub ctl_port: Option<u16>,
    /// YAML config file.
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
