mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{split, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use xltop::config::{overlay, ConfigFile};
use xltop::sampler::{run_push_loop, NullSampler, PushConn};

const DEFAULT_REMOTE_PORT: u16 = 9901;
const DEFAULT_PUSH_INTERVAL_SECS: f64 = 10.0;
const PUSH_WR_BUF_SIZE: usize = 4096;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

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
    let interval = overlay(args.interval, config_file.interval, DEFAULT_PUSH_INTERVAL_SECS);
    let job = args.job.or(config_file.job);

    if interval <= 0.0 {
        error!(interval, "invalid interval, must be positive");
        return ExitCode::from(2);
    }

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

    info!(%remote_host, remote_port, interval, job = ?job, "starting agent push loop");

    match run(remote_host, remote_port, interval, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "agent exited with an error");
            ExitCode::FAILURE
        },
    }
}

async fn run(
    remote_host: String,
    remote_port: u16,
    interval: f64,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = TcpStream::connect((remote_host.as_str(), remote_port))
        .await
        .with_context(|| format!("connecting to {remote_host}:{remote_port}"))?;
    stream.set_nodelay(true).context("setting NODELAY")?;

    let (mut rh, wh) = split(stream);

    // The push loop never reads; drain and discard reply frames so the
    // aggregator's writes never back up against a full socket buffer.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match rh.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {},
            }
        }
    });

    let conn = PushConn::new(wh, PUSH_WR_BUF_SIZE);

    // Local sample acquisition (/proc, Lustre obdfilter stats, ...) is
    // out of scope (§1); `NullSampler` keeps the push loop's connection
    // and timing machinery live with no readings to report until a real
    // source is wired in.
    let sampler = NullSampler;

    select! {
        _ = run_push_loop(sampler, conn, Duration::from_secs_f64(interval), cancel.clone()) => {},
        _ = cancel.cancelled() => {},
    }

    Ok(())
}
