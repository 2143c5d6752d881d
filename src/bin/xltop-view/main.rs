mod args;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::args::Args;
use xltop::config::{overlay, ConfigFile};
use xltop::query::TopRow;
use xltop::viewer::{build_viewer_query, run_viewer_loop, ViewerDriver};

const DEFAULT_REMOTE_PORT: u16 = 9901;
const DEFAULT_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_LIMIT: usize = 4096;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config_file = match &args.conf {
        Some(path) => match ConfigFile::load(path) {
            Ok(c) => c,
            Err(error) => {
                error!(%error, "failed to load config file");
                return ExitCode::from(2);
            },
        },
        None => ConfigFile::default(),
    };

    let remote_host = match overlay(args.remote_host, config_file.remote_host, String::new()) {
        h if h.is_empty() => {
            error!("no remote host specified (pass --remote-host or set it in the config file)");
            return ExitCode::from(2);
        },
        h => h,
    };
    let remote_port = overlay(args.remote_port, config_file.remote_port, DEFAULT_REMOTE_PORT);
    let interval = overlay(args.interval, config_file.interval, DEFAULT_INTERVAL_SECS);
    let limit = overlay(args.limit, config_file.limit, DEFAULT_LIMIT);

    if interval <= 0.0 {
        error!(interval, "invalid interval, must be positive");
        return ExitCode::from(2);
    }

    let mut query = match build_viewer_query(&args.selectors, limit) {
        Ok(q) => q,
        Err(message) => {
            error!(%message, "invalid selector arguments");
            return ExitCode::from(2);
        },
    };
    query.sort_key = args.sort_key.clone();
    query.sum = args.sum;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            cancel.cancel();
        });
    }

    let base_url = format!("http://{remote_host}:{remote_port}");

    // The real terminal renderer (column layout, sorting by --sort-key,
    // --sum toggling) is an out-of-scope collaborator (§1, §4.6); this
    // stand-in prints one line per row so the push/poll machinery above it
    // is exercised end to end. `sort_key`/`sum` are also sent to the
    // aggregator in the query string itself (`ViewerQuery::to_query_string`);
    // the render-side copies here only drive this stand-in's own labeling.
    let sort_key = query.sort_key.clone();
    let sum = query.sum;
    let driver = ViewerDriver::new(base_url, query, move |rows: &[TopRow]| render(rows, sort_key.as_deref(), sum));

    run_viewer_loop(driver, Duration::from_secs_f64(interval), cancel).await;

    ExitCode::SUCCESS
}

fn render(rows: &[TopRow], sort_key: Option<&str>, sum: bool) {
    println!("--- top {} ({}) ---", rows.len(), sort_key.unwrap_or("rate"));
    for row in rows {
        let value = if sum { row.sum } else { row.rate };
        println!("{}:{} {}:{} {value:?}", row.x0.0, row.x0.1, row.x1.0, row.x1.1);
    }
}
